#![cfg(not(tarpaulin_include))]

use erp::config::ErpConfig;
use erp::db;
use erp::money::Money;
use erp::users::{self, NewUser, UserFilter};
use std::env;
use std::path::PathBuf;

fn usage(program: &str) {
    eprintln!("Usage: {} [--config <file>] <command>", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  init                                   create the database schema");
    eprintln!("  create-user <username> <email> <full_name> <role> <password> [basic_salary]");
    eprintln!("  list-users                             print every account");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = env::args().collect();
    let program = args.remove(0);

    let mut config_path = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            usage(&program);
            std::process::exit(2);
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }

    let Some(command) = args.first().cloned() else {
        usage(&program);
        std::process::exit(2);
    };

    let config = ErpConfig::load(config_path.as_deref())?;
    let conn = db::open(&config.database_path)?;

    match command.as_str() {
        "init" => {
            println!("Database ready at {}", config.database_path.display());
        }
        "create-user" => {
            if args.len() < 6 || args.len() > 7 {
                usage(&program);
                std::process::exit(2);
            }
            let basic_salary: Money = match args.get(6) {
                Some(amount) => amount.parse()?,
                None => Money::ZERO,
            };
            let new_user = NewUser {
                username: args[1].clone(),
                email: args[2].clone(),
                full_name: args[3].clone(),
                role: args[4].parse()?,
                basic_salary,
                password: args[5].clone(),
            };
            let id = users::create_user(&conn, &new_user)?;
            println!("Created user {} with id {}", new_user.username, id);
        }
        "list-users" => {
            let all = users::list_users(&conn, &UserFilter::default())?;
            println!(
                "{:<5} {:<20} {:<30} {:<10} {:<9} {:>12}",
                "ID", "USERNAME", "EMAIL", "ROLE", "STATUS", "SALARY"
            );
            for user in all {
                println!(
                    "{:<5} {:<20} {:<30} {:<10} {:<9} {:>12}",
                    user.id,
                    user.username,
                    user.email,
                    user.role.as_str(),
                    user.status.as_str(),
                    user.basic_salary.to_string()
                );
            }
        }
        other => {
            eprintln!("Unknown command '{}'", other);
            usage(&program);
            std::process::exit(2);
        }
    }

    Ok(())
}
