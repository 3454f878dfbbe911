mod common;

use common::{conn, user};
use erp::auth::Role;
use erp::error::AppError;
use erp::money::Money;
use erp::payroll::{
    self, ItemInput, ItemKind, PayrollAction, PayrollFilter, PayrollStatus,
};

#[test]
fn create_makes_one_record_per_salaried_active_employee() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    user(&conn, "ann", Role::Employee, 300_000);
    user(&conn, "bob", Role::Employee, 250_000);
    let gone = user(&conn, "gone", Role::Employee, 100_000);
    conn.execute("UPDATE users SET status = 'inactive' WHERE id = ?1", [gone.id])
        .unwrap();

    let id = payroll::create_payroll(&conn, &hr, "2024-05", "May salaries").unwrap();
    let master = payroll::get_payroll(&conn, id).unwrap();

    assert_eq!(master.transaction_no, "PAY-202405-0001");
    assert_eq!(master.status, PayrollStatus::Draft);
    assert_eq!(master.record_count, 2);
    assert_eq!(master.total, Money::from_cents(550_000));
}

#[test]
fn transaction_numbers_count_up_per_period() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);

    let a = payroll::create_payroll(&conn, &hr, "2024-05", "Regular").unwrap();
    let b = payroll::create_payroll(&conn, &hr, "2024-05", "Bonus run").unwrap();
    let c = payroll::create_payroll(&conn, &hr, "2024-06", "Regular").unwrap();

    let no = |id| payroll::get_payroll(&conn, id).unwrap().transaction_no;
    assert_eq!(no(a), "PAY-202405-0001");
    assert_eq!(no(b), "PAY-202405-0002");
    assert_eq!(no(c), "PAY-202406-0001");

    let filtered = payroll::list_payrolls(
        &conn,
        &PayrollFilter {
            period: Some("2024-05".to_string()),
            ..PayrollFilter::default()
        },
    )
    .unwrap();
    assert_eq!(filtered.len(), 2);
}

#[test]
fn single_digit_months_are_rejected() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    user(&conn, "ann", Role::Employee, 300_000);

    let err = payroll::create_payroll(&conn, &hr, "2024-3", "March").unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(payroll::list_payrolls(&conn, &PayrollFilter::default()).unwrap().is_empty());

    let id = payroll::create_payroll(&conn, &hr, "2024-03", "March").unwrap();
    assert_eq!(payroll::get_payroll(&conn, id).unwrap().transaction_no, "PAY-202403-0001");
}

#[test]
fn items_keep_record_and_batch_totals_in_sync() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    user(&conn, "ann", Role::Employee, 300_000);
    user(&conn, "bob", Role::Employee, 200_000);
    let id = payroll::create_payroll(&conn, &hr, "2024-05", "May").unwrap();
    let records = payroll::records_for(&conn, id).unwrap();
    let ann = records.iter().find(|r| r.employee_username == "ann").unwrap();

    payroll::add_item(&conn, &hr, ann.id, ItemKind::Earning, "Overtime", Money::from_cents(25_000))
        .unwrap();
    let totals = payroll::add_item(
        &conn,
        &hr,
        ann.id,
        ItemKind::Deduction,
        "Tax",
        Money::from_cents(40_000),
    )
    .unwrap();

    assert_eq!(totals.earnings, Money::from_cents(325_000));
    assert_eq!(totals.deductions, Money::from_cents(40_000));
    assert_eq!(totals.net, Money::from_cents(285_000));
    assert_eq!(totals.payroll_total, Money::from_cents(485_000));

    let record = payroll::get_record(&conn, ann.id).unwrap();
    let tax = record.items.iter().find(|i| i.description == "Tax").unwrap();
    let updated = payroll::update_items(
        &conn,
        &hr,
        ann.id,
        &[
            ItemInput {
                id: Some(tax.id),
                kind: ItemKind::Deduction,
                description: "Income tax".to_string(),
                amount: Money::from_cents(50_000),
            },
            ItemInput {
                id: None,
                kind: ItemKind::Earning,
                description: "Bonus".to_string(),
                amount: Money::from_cents(10_000),
            },
        ],
    )
    .unwrap();
    assert_eq!(updated.net, Money::from_cents(285_000));
    assert_eq!(updated.payroll_total, Money::from_cents(485_000));

    let after_delete = payroll::delete_item(&conn, &hr, tax.id).unwrap();
    assert_eq!(after_delete.deductions, Money::ZERO);
    assert_eq!(after_delete.net, Money::from_cents(335_000));
    assert_eq!(
        payroll::get_payroll(&conn, id).unwrap().total,
        Money::from_cents(535_000)
    );
}

#[test]
fn item_ids_from_another_record_are_rejected() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    user(&conn, "ann", Role::Employee, 300_000);
    user(&conn, "bob", Role::Employee, 200_000);
    let id = payroll::create_payroll(&conn, &hr, "2024-05", "May").unwrap();
    let records = payroll::records_for(&conn, id).unwrap();

    payroll::add_item(&conn, &hr, records[0].id, ItemKind::Earning, "Bonus", Money::from_cents(100))
        .unwrap();
    let foreign = payroll::get_record(&conn, records[0].id).unwrap().items[0].id;

    let err = payroll::update_items(
        &conn,
        &hr,
        records[1].id,
        &[ItemInput {
            id: Some(foreign),
            kind: ItemKind::Earning,
            description: "Stolen".to_string(),
            amount: Money::from_cents(999_999),
        }],
    )
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let untouched = payroll::get_record(&conn, records[0].id).unwrap();
    assert_eq!(untouched.items[0].description, "Bonus");
}

#[test]
fn full_lifecycle_respects_permissions_and_states() {
    let conn = conn();
    let admin = user(&conn, "admin", Role::Admin, 0);
    let hr = user(&conn, "hana", Role::Hr, 0);
    let manager = user(&conn, "boss", Role::Manager, 0);
    let ann = user(&conn, "ann", Role::Employee, 300_000);
    let id = payroll::create_payroll(&conn, &hr, "2024-05", "May").unwrap();

    // Locking straight from draft is not a valid transition
    let err = payroll::apply_action(&conn, &manager, id, PayrollAction::Lock).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    assert_eq!(
        payroll::apply_action(&conn, &hr, id, PayrollAction::Review).unwrap(),
        Some(PayrollStatus::Reviewed)
    );

    // HR cannot lock
    let err = payroll::apply_action(&conn, &hr, id, PayrollAction::Lock).unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    assert_eq!(
        payroll::apply_action(&conn, &manager, id, PayrollAction::Lock).unwrap(),
        Some(PayrollStatus::Locked)
    );

    let record = &payroll::records_for(&conn, id).unwrap()[0];
    let err = payroll::add_item(&conn, &hr, record.id, ItemKind::Earning, "Late", Money::from_cents(1))
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Only an admin may unlock
    let err = payroll::apply_action(&conn, &manager, id, PayrollAction::Unlock).unwrap_err();
    assert!(matches!(err, AppError::Forbidden));
    payroll::apply_action(&conn, &admin, id, PayrollAction::Unlock).unwrap();
    payroll::apply_action(&conn, &manager, id, PayrollAction::Lock).unwrap();

    assert_eq!(
        payroll::apply_action(&conn, &hr, id, PayrollAction::Pay).unwrap(),
        Some(PayrollStatus::Paid)
    );
    let master = payroll::get_payroll(&conn, id).unwrap();
    assert!(master.paid_at.is_some());

    let err = payroll::apply_action(&conn, &admin, id, PayrollAction::Delete).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let slips = payroll::payslips_for(&conn, ann.id).unwrap();
    assert_eq!(slips.len(), 1);
    assert_eq!(slips[0].record.net, Money::from_cents(300_000));
}

#[test]
fn empty_payrolls_cannot_be_reviewed_and_drafts_can_be_deleted() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    let id = payroll::create_payroll(&conn, &hr, "2024-05", "Nobody").unwrap();

    let err = payroll::apply_action(&conn, &hr, id, PayrollAction::Review).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    assert_eq!(payroll::apply_action(&conn, &hr, id, PayrollAction::Delete).unwrap(), None);
    assert!(payroll::find_payroll(&conn, id).unwrap().is_none());
}

#[test]
fn draft_records_can_be_added_repriced_and_removed() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    let ann = user(&conn, "ann", Role::Employee, 300_000);
    let unpaid = user(&conn, "intern", Role::Employee, 0);
    let id = payroll::create_payroll(&conn, &hr, "2024-05", "May").unwrap();

    payroll::add_record(&conn, &hr, id, unpaid.id).unwrap();
    let err = payroll::add_record(&conn, &hr, id, ann.id).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let intern_record = payroll::records_for(&conn, id)
        .unwrap()
        .into_iter()
        .find(|r| r.employee_id == unpaid.id)
        .unwrap();
    let totals =
        payroll::update_basic_salary(&conn, &hr, intern_record.id, Money::from_cents(50_000)).unwrap();
    assert_eq!(totals.payroll_total, Money::from_cents(350_000));

    assert_eq!(payroll::remove_record(&conn, &hr, intern_record.id).unwrap(), id);
    assert_eq!(
        payroll::get_payroll(&conn, id).unwrap().total,
        Money::from_cents(300_000)
    );

    payroll::apply_action(&conn, &hr, id, PayrollAction::Review).unwrap();
    let err = payroll::update_title(&conn, &hr, id, "Renamed").unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn employees_cannot_see_or_edit_payroll() {
    let conn = conn();
    let hr = user(&conn, "hana", Role::Hr, 0);
    let ann = user(&conn, "ann", Role::Employee, 300_000);
    let id = payroll::create_payroll(&conn, &hr, "2024-05", "May").unwrap();

    assert!(matches!(
        payroll::create_payroll(&conn, &ann, "2024-06", "Mine").unwrap_err(),
        AppError::Forbidden
    ));
    assert!(matches!(
        payroll::apply_action(&conn, &ann, id, PayrollAction::Review).unwrap_err(),
        AppError::Forbidden
    ));
    assert!(PayrollAction::available(PayrollStatus::Draft, &ann).is_empty());
}
