//! Calculator demo.
//!
//! `cairn.toml` splits the plugins into a `front` container (this process)
//! and a `math` container (a child process of this binary). Replace the
//! `[[containers]]` tables with a top-level `plugins` list to run everything
//! in one process.
//!
//! Run it from this directory so `cairn.toml` is found:
//!
//! ```text
//! cargo run
//! CAIRN_LOGGING__LEVEL=debug cargo run
//! ```

use std::collections::HashMap;

use cairn::prelude::*;
use serde_json::{Value, json};
use tracing::{info, warn};

// ─── calculator ─────────────────────────────────────────────────────────────

struct Calculator {
    precision: u32,
}

impl Calculator {
    fn round(&self, value: f64) -> f64 {
        let factor = 10f64.powi(self.precision as i32);
        (value * factor).round() / factor
    }
}

#[async_trait]
impl ServiceInterface for Calculator {
    fn operations(&self) -> Vec<String> {
        ["add", "subtract", "multiply", "divide"]
            .map(String::from)
            .to_vec()
    }

    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError> {
        let [a, b] = args.as_slice() else {
            return Err(format!("{operation} takes two arguments").into());
        };
        let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
            return Err("arguments must be numbers".into());
        };
        let result = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" if b == 0.0 => return Err("division by zero".into()),
            "divide" => a / b,
            other => return Err(format!("unknown operation {other}").into()),
        };
        Ok(json!(self.round(result)))
    }
}

fn calculator() -> PluginDescriptor {
    PluginDescriptor::new("calculator")
        .provides(["calc"])
        .consumes(Vec::<String>::new())
        .options(json!({ "precision": 4 }))
        .with_setup(sync_setup(|ctx| {
            let precision = ctx
                .options()
                .get("precision")
                .and_then(Value::as_u64)
                .unwrap_or(4) as u32;
            info!(precision, "Calculator ready");
            Ok(Provided::new().service("calc", Service::with_interface(Calculator { precision })))
        }))
}

// ─── db / auth ──────────────────────────────────────────────────────────────

struct Database {
    users: HashMap<String, String>,
}

fn db() -> PluginDescriptor {
    PluginDescriptor::new("db")
        .provides(["database"])
        .consumes(Vec::<String>::new())
        .with_setup(sync_setup(|_ctx| {
            let users = HashMap::from([
                ("ada".to_string(), "lovelace".to_string()),
                ("alan".to_string(), "turing".to_string()),
            ]);
            Ok(Provided::new()
                .service("database", Service::new(Database { users }))
                .on_destroy(|| async {
                    info!("Database closed");
                    Ok::<_, BoxError>(())
                }))
        }))
}

struct Auth {
    db: std::sync::Arc<Database>,
}

impl Auth {
    fn users(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.db.users.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.db.users.get(username).is_some_and(|p| p == password)
    }
}

/// Registers through the completion callback, like a plugin that finishes
/// its setup from some other task.
fn auth() -> PluginDescriptor {
    PluginDescriptor::new("auth")
        .provides(["auth"])
        .consumes(["database"])
        .with_setup(callback_setup(|ctx, register| {
            let Some(db) = ctx.imports().get_as::<Database>("database") else {
                register.err("database service has an unexpected type");
                return;
            };
            tokio::spawn(async move {
                register.ok(Provided::new().service("auth", Service::new(Auth { db })));
            });
        }))
}

// ─── console ────────────────────────────────────────────────────────────────

fn console() -> PluginDescriptor {
    PluginDescriptor::new("console")
        .provides(Vec::<String>::new())
        .consumes(["auth", "calc", "hub"])
        .with_setup(setup_fn(|ctx| async move {
            let imports = ctx.into_imports();
            let auth = imports
                .get_as::<Auth>("auth")
                .ok_or("auth service has an unexpected type")?;
            let calc = imports.require("calc")?.clone();

            if let Some(hub) = imports.hub() {
                let mut events = hub.subscribe();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        info!(event = ?event, "Hub event");
                    }
                });
            }

            info!(users = ?auth.users(), "Known users");
            if !auth.authenticate("ada", "babbage") {
                warn!(user = "ada", "Rejected wrong password");
            }

            let sum = calc.call("add", vec![json!(40), json!(2)]).await?;
            let ratio = calc.call("divide", vec![json!(1), json!(3)]).await?;
            info!(remote = calc.is_remote(), %sum, %ratio, "Calculator answered");

            if let Err(e) = calc.call("divide", vec![json!(1), json!(0)]).await {
                warn!(error = %e, "Calculator refused");
            }

            Ok::<_, BoxError>(Provided::new())
        }))
}

fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(calculator())
        .with(db())
        .with(auth())
        .with(console())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = CairnRuntime::new(catalog());
    runtime.run().await?;
    Ok(())
}
