//! Tabular exports: CSV, XLSX and an HTML table that spreadsheet programs open.

#[cfg(feature = "web")]
use crate::error::AppResult;
use crate::money::Money;
use crate::payroll::{PayrollMaster, PayrollRecord};
use crate::projects::Project;
use crate::users::User;

/// A cell in an export. Amounts stay numeric in XLSX output.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Amount(Money),
    Int(i64),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    fn render(&self) -> String {
        match self {
            Cell::Text(text) => text.clone(),
            Cell::Amount(money) => money.to_string(),
            Cell::Int(n) => n.to_string(),
        }
    }
}

/// Header row plus data rows, shared by every export format.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(title: impl Into<String>, headers: &[&str]) -> Self {
        Table {
            title: title.into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Convert a table to CSV with RFC 4180 quoting.
pub fn to_csv(table: &Table) -> String {
    let mut csv_content = String::new();

    let header: Vec<String> = table.headers.iter().map(|h| csv_field(h)).collect();
    csv_content.push_str(&header.join(","));
    csv_content.push_str("\r\n");

    for row in &table.rows {
        let fields: Vec<String> = row.iter().map(|cell| csv_field(&cell.render())).collect();
        csv_content.push_str(&fields.join(","));
        csv_content.push_str("\r\n");
    }

    csv_content
}

/// Standalone HTML document holding one table. Cell text is escaped with the
/// same rules as the page templates.
#[cfg(feature = "web")]
pub fn to_html_table(table: &Table) -> String {
    use handlebars::html_escape as escape;

    let mut html = String::from("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
    html.push_str(&format!("<title>{}</title></head><body>\n", escape(&table.title)));
    html.push_str("<table border=\"1\">\n<thead><tr>");
    for header in &table.headers {
        html.push_str(&format!("<th>{}</th>", escape(header)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row in &table.rows {
        html.push_str("<tr>");
        for cell in row {
            match cell {
                Cell::Text(_) => html.push_str(&format!("<td>{}</td>", escape(&cell.render()))),
                _ => html.push_str(&format!(
                    "<td style=\"text-align:right\">{}</td>",
                    escape(&cell.render())
                )),
            }
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n</body></html>\n");
    html
}

/// Convert a table to XLSX with a bold header row.
#[cfg(feature = "web")]
pub fn to_xlsx(table: &Table) -> AppResult<Vec<u8>> {
    use crate::error::AppError;
    use rust_xlsxwriter::{Format, Workbook, Worksheet};

    let xlsx_err = |e: rust_xlsxwriter::XlsxError| AppError::Internal(format!("xlsx export: {e}"));

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    let bold = Format::new().set_bold();

    for (c, header) in table.headers.iter().enumerate() {
        worksheet
            .write_string_with_format(0, c as u16, header, &bold)
            .map_err(xlsx_err)?;
    }

    for (r, row) in table.rows.iter().enumerate() {
        let r = (r + 1) as u32;
        for (c, cell) in row.iter().enumerate() {
            let c = c as u16;
            match cell {
                Cell::Text(text) => worksheet.write_string(r, c, text).map_err(xlsx_err)?,
                Cell::Amount(money) => worksheet
                    .write_number(r, c, money.cents() as f64 / 100.0)
                    .map_err(xlsx_err)?,
                Cell::Int(n) => worksheet.write_number(r, c, *n as f64).map_err(xlsx_err)?,
            };
        }
    }

    workbook.push_worksheet(worksheet);
    workbook.save_to_buffer().map_err(xlsx_err)
}

pub fn payroll_table(master: &PayrollMaster, records: &[PayrollRecord]) -> Table {
    let mut table = Table::new(
        format!("{} {}", master.transaction_no, master.title),
        &["Employee", "Username", "Basic", "Earnings", "Deductions", "Net"],
    );
    for record in records {
        table.rows.push(vec![
            Cell::text(&record.employee_name),
            Cell::text(&record.employee_username),
            Cell::Amount(record.basic_salary),
            Cell::Amount(record.earnings),
            Cell::Amount(record.deductions),
            Cell::Amount(record.net),
        ]);
    }
    let total: Money = records.iter().map(|r| r.net).sum();
    table.rows.push(vec![
        Cell::text("Total"),
        Cell::text(""),
        Cell::text(""),
        Cell::text(""),
        Cell::text(""),
        Cell::Amount(total),
    ]);
    table
}

pub fn users_table(users: &[User]) -> Table {
    let mut table = Table::new(
        "Users",
        &["Username", "Full name", "Email", "Role", "Status", "Basic salary", "Created"],
    );
    for user in users {
        table.rows.push(vec![
            Cell::text(&user.username),
            Cell::text(&user.full_name),
            Cell::text(&user.email),
            Cell::text(user.role.as_str()),
            Cell::text(user.status.as_str()),
            Cell::Amount(user.basic_salary),
            Cell::text(&user.created_at),
        ]);
    }
    table
}

pub fn projects_table(projects: &[Project]) -> Table {
    let mut table = Table::new(
        "Projects",
        &["Code", "Name", "Status", "Owner", "Start", "End", "Progress %", "Tasks", "Done"],
    );
    for project in projects {
        table.rows.push(vec![
            Cell::text(&project.code),
            Cell::text(&project.name),
            Cell::text(project.status.label()),
            Cell::text(&project.owner_name),
            Cell::text(project.start_date.clone().unwrap_or_default()),
            Cell::text(project.end_date.clone().unwrap_or_default()),
            Cell::Int(project.progress),
            Cell::Int(project.task_count),
            Cell::Int(project.done_count),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut table = Table::new("Sample", &["Name", "Amount"]);
        table.rows.push(vec![Cell::text("Smith, Jane"), Cell::Amount(Money(150_050))]);
        table.rows.push(vec![Cell::text("say \"hi\""), Cell::Int(3)]);
        table
    }

    #[test]
    fn csv_quotes_special_fields() {
        let csv = to_csv(&sample());
        let lines: Vec<&str> = csv.split("\r\n").collect();
        assert_eq!(lines[0], "Name,Amount");
        assert_eq!(lines[1], "\"Smith, Jane\",1500.50");
        assert_eq!(lines[2], "\"say \"\"hi\"\"\",3");
    }

    #[cfg(feature = "web")]
    #[test]
    fn html_escapes_cells() {
        let mut table = sample();
        table.rows.push(vec![Cell::text("<script>"), Cell::Int(0)]);
        let html = to_html_table(&table);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("<th>Amount</th>"));
    }
}
