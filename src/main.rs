use echoql::catalog::SchemaCatalog;
use echoql::config::PipelineConfig;
use echoql::execution::ResultSet;
use echoql::pipeline::Pipeline;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echoql")]
#[command(about = "Ask questions about your data in plain language")]
#[command(version)]
struct Args {
    /// Schema catalog directory or file (overrides ECHOQL_CATALOG_PATH)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Directory of CSV/Parquet tables (overrides ECHOQL_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Pre-built JSONL vector index (overrides ECHOQL_INDEX_PATH)
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question against the data store
    Query {
        query: String,

        /// Write the result set to this CSV file
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// Repair cycles allowed after a failed validation
        #[arg(long)]
        max_repairs: Option<u32>,

        /// Print the full run output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the schema catalog as the models see it
    Describe {
        /// Only these tables, in this order
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    /// Show which tables retrieval picks for a question
    Retrieve {
        query: String,

        #[arg(short, long)]
        k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(catalog) = args.catalog {
        config.catalog_path = catalog;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(index) = args.index {
        config.index_path = Some(index);
    }
    if let Some(api_key) = args.api_key {
        config.api_key = api_key;
    }

    match args.command {
        Commands::Query {
            query,
            export,
            max_repairs,
            json,
        } => {
            if let Some(max_repairs) = max_repairs {
                config.max_repairs = max_repairs;
            }
            run_query(&config, &query, export, json).await
        }
        Commands::Describe { tables } => describe(&config, &tables),
        Commands::Retrieve { query, k } => retrieve(&config, &query, k).await,
    }
}

async fn run_query(config: &PipelineConfig, query: &str, export: Option<PathBuf>, json: bool) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let output = match pipeline.run(query).await {
        Ok(output) => output,
        Err(e) => {
            eprintln!("[{}] {}", e.kind(), e);
            std::process::exit(1);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("\n{}", "=".repeat(80));
        println!(" {}", output.user_query);
        println!("{}", "=".repeat(80));
        println!("\nSQL:\n{}\n", output.sql);
        if output.repair_attempts > 0 {
            println!("(repaired after {} cycle(s))\n", output.repair_attempts);
        }
        print_table(&output.result, 50);
    }

    if let Some(path) = export {
        let file = File::create(&path).with_context(|| format!("Cannot create {}", path.display()))?;
        output.result.write_csv(file)?;
        info!("Exported {} rows to {}", output.result.row_count(), path.display());
        println!("\nExported {} rows to {}", output.result.row_count(), path.display());
    }
    Ok(())
}

fn describe(config: &PipelineConfig, tables: &[String]) -> Result<()> {
    let catalog = SchemaCatalog::load(&config.catalog_path)?;
    if tables.is_empty() {
        println!("{}", catalog.describe());
    } else {
        println!("{}", catalog.describe_tables(tables));
    }
    Ok(())
}

async fn retrieve(config: &PipelineConfig, query: &str, k: Option<usize>) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let result = pipeline
        .retriever()
        .retrieve(query, k.unwrap_or(config.top_k))
        .await?;

    println!("Enriched query: {}\n", result.enriched_query);
    if result.is_empty() {
        println!("No matching tables.");
    }
    for (rank, table) in result.tables.iter().enumerate() {
        println!("{:>2}. {:<40} {:.4}", rank + 1, table.id, table.score);
    }
    Ok(())
}

fn print_table(result: &ResultSet, max_rows: usize) {
    let names = result.column_names();
    println!("{}", names.join(" | "));
    println!("{}", "-".repeat(names.iter().map(|n| n.len() + 3).sum::<usize>().max(3)));
    for row in result.rows.iter().take(max_rows) {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                serde_json::Value::Null => "NULL".to_string(),
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
    if result.row_count() > max_rows {
        println!("... {} more row(s)", result.row_count() - max_rows);
    }
    println!("\n{} row(s){}", result.row_count(), if result.truncated { " (truncated)" } else { "" });
}
