// Module declarations
mod agent;
mod audit;
mod auth;
mod cli;
mod config;
mod dispatch;
mod error;
mod instruction;
mod queue;
mod registry;
mod server;
mod sessions;
mod types;
mod user_db;
mod util;

// Re-export module items at the crate root so cross-module references
// stay short.
#[allow(unused_imports)]
pub(crate) use agent::*;
#[allow(unused_imports)]
pub(crate) use audit::*;
#[allow(unused_imports)]
pub(crate) use auth::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use dispatch::*;
#[allow(unused_imports)]
pub(crate) use error::*;
#[allow(unused_imports)]
pub(crate) use instruction::*;
#[allow(unused_imports)]
pub(crate) use queue::*;
#[allow(unused_imports)]
pub(crate) use registry::*;
#[allow(unused_imports)]
pub(crate) use server::*;
#[allow(unused_imports)]
pub(crate) use sessions::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use user_db::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::fs;

use clap::Parser;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init { data_dir } => {
            fs::create_dir_all(client_tools_dir(&data_dir))?;
            fs::create_dir_all(log_dir_path(&data_dir))?;
            let _ = UserDb::open_or_create(&user_db_path(&data_dir))?;
            let config_path = tools_config_path(&data_dir);
            if !config_path.exists() {
                save_tools_config(&config_path, &ToolsConfig::default())?;
            }
            println!("Initialized {}", data_dir.display());
            Ok(())
        }

        Command::Serve {
            bind,
            port,
            data_dir,
            workers,
            admin_password,
        } => {
            let admin_password = admin_password
                .or_else(|| env_optional("TOOLSHED_ADMIN_PASSWORD"))
                .unwrap_or_else(|| "secret".to_string());
            run_server(bind, port, data_dir, admin_password, workers)
        }

        Command::Agent {
            server,
            username,
            password,
            poll_secs,
            error_backoff_secs,
        } => run_agent(AgentOptions {
            server_url: server,
            username,
            password,
            poll_secs,
            error_backoff_secs,
        }),

        Command::User(command) => match command {
            UserCommand::Add {
                username,
                email,
                password,
                first_name,
                last_name,
                external,
                data_dir,
            } => {
                let db = UserDb::open_or_create(&user_db_path(&data_dir))?;
                db.create_user(&NewUser {
                    username: username.clone(),
                    email,
                    password,
                    first_name,
                    last_name,
                    external_features: external,
                })?;
                println!("Created user {username}");
                Ok(())
            }

            UserCommand::List { data_dir, json } => {
                let db = UserDb::open_or_create(&user_db_path(&data_dir))?;
                let users = db.list_users()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&users)?);
                } else {
                    for user in &users {
                        let external = if user.external_features { "yes" } else { "no" };
                        println!("{}  <{}>  external: {external}", user.username, user.email);
                    }
                }
                Ok(())
            }

            UserCommand::SetExternal {
                username,
                state,
                data_dir,
            } => {
                let db = UserDb::open_or_create(&user_db_path(&data_dir))?;
                let enabled = state == "on";
                if db.set_external_features(&username, enabled)? {
                    println!("External tools {state} for {username}");
                    Ok(())
                } else {
                    eprintln!("No such user: {username}");
                    std::process::exit(2);
                }
            }
        },
    }
}
