mod config;

use clap::Parser;
use config::Config;
use datacave_client::{Connection, QueryResult};
use datacave_core::DataValue;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

/// Run SQL statements against a PostgreSQL-compatible server.
#[derive(Debug, Parser)]
#[command(name = "datacave", version)]
struct Args {
    /// TOML file with a `[connection]` section. Without it the PG* environment is used.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    database: Option<String>,
    /// Per-statement timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Statements, run in order.
    #[arg(required = true)]
    sql: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::from_env()?,
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let conn = Connection::connect(config.connection.clone()).await?;
    let server_version = conn.server_parameter("server_version");
    info!(
        server_version = server_version.as_deref().unwrap_or("unknown"),
        "connected"
    );
    let outcome = run_statements(&conn, &args.sql).await;
    conn.stop().await?;
    outcome
}

fn apply_overrides(config: &mut Config, args: &Args) {
    let conn = &mut config.connection;
    if let Some(host) = &args.host {
        conn.host = host.clone();
    }
    if let Some(port) = args.port {
        conn.port = port;
    }
    if let Some(user) = &args.user {
        conn.user = user.clone();
    }
    if let Some(database) = &args.database {
        conn.database = Some(database.clone());
    }
    if let Some(timeout_ms) = args.timeout_ms {
        conn.query_timeout_ms = timeout_ms;
    }
}

async fn run_statements(conn: &Connection, statements: &[String]) -> anyhow::Result<()> {
    for sql in statements {
        let result = conn.query(sql).await?;
        print_result(&result);
    }
    Ok(())
}

fn print_result(result: &QueryResult) {
    if !result.columns.is_empty() {
        let header: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
        println!("{}", header.join("\t"));
        for row in &result.rows {
            let cells: Vec<String> = row.values.iter().map(render).collect();
            println!("{}", cells.join("\t"));
        }
    }
    println!("{}", result.tag);
}

fn render(value: &DataValue) -> String {
    match value {
        DataValue::Null => "NULL".to_string(),
        other => other
            .to_text()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_default(),
    }
}
