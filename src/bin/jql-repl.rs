//! jqlstore Interactive REPL
//!
//! Runs JQL queries against one tenant collection of a local store.
//!
//! Usage: jql-repl [OPTIONS]
//!
//! Options:
//!   -c, --config-dir <DIR>     Directory holding jqlstore.toml (default: .)
//!   -t, --tenant <ID>          Tenant id (default: 1)
//!   -C, --collection <NAME>    Collection to query (default: default)

use clap::Parser;
use colored::Colorize;
use jqlstore::{Store, StoreConfig, TenantId};
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use serde_json::Value;
use std::borrow::Cow;

#[derive(Parser, Debug)]
#[command(name = "jql-repl")]
#[command(about = "jqlstore Interactive JQL REPL", long_about = None)]
struct Args {
    /// Directory holding jqlstore.toml and .env
    #[arg(short, long, default_value = ".")]
    config_dir: std::path::PathBuf,

    /// Tenant id
    #[arg(short, long, default_value_t = 1)]
    tenant: TenantId,

    /// Collection name
    #[arg(short = 'C', long, default_value = "default")]
    collection: String,
}

/// Keyword completion
struct JqlHelper {
    completions: Vec<&'static str>,
}

impl JqlHelper {
    fn new() -> Self {
        Self {
            completions: vec![
                // commands
                ":insert", ":get", ":explain", ":use", ":collections", ":help", ":quit",
                // keywords
                "and", "or", "order", "numeric", "asc", "desc", "limit", "offset", "as",
                "true", "false", "null", "$id",
                // aggregates
                "count", "sum", "avg", "min", "max", "var", "stddev", "cov", "corr", "regr",
            ],
        }
    }

    fn word_start(line: &str) -> usize {
        line.rfind(|c: char| c.is_whitespace() || c == '(' || c == ',')
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

impl Completer for JqlHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let start = Self::word_start(&line[..pos]);
        let word = &line[start..pos];

        let matches = self
            .completions
            .iter()
            .filter(|c| c.starts_with(word))
            .map(|c| Pair {
                display: c.to_string(),
                replacement: c.to_string(),
            })
            .collect();

        Ok((start, matches))
    }
}

impl Hinter for JqlHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Option<String> {
        if pos < line.len() {
            return None;
        }
        let word = &line[Self::word_start(line)..];
        if word.is_empty() {
            return None;
        }
        self.completions
            .iter()
            .find(|c| c.starts_with(word) && c.len() > word.len())
            .map(|c| c[word.len()..].to_string())
    }
}

impl Highlighter for JqlHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Cow::Owned(hint.truecolor(100, 100, 100).to_string())
    }
}

impl Validator for JqlHelper {}

impl Helper for JqlHelper {}

fn print_help() {
    println!("\n{}", "Commands:".white().bold());
    println!("  {} <json>     Insert an object or an array of objects", ":insert".yellow());
    println!("  {} <id>          Fetch a document by id", ":get".yellow());
    println!("  {} <query>   Show the SQL translation", ":explain".yellow());
    println!("  {} <name>        Switch collection", ":use".yellow());
    println!("  {}       List collections", ":collections".yellow());
    println!("  {}             Exit the REPL", ":quit".yellow());

    println!("\n{}", "Examples:".white().bold());
    println!("  {}", "age >= 18 and name.first = 'John' order numeric(age) desc limit 10".green());
    println!("  {}", "| count(*) as n, avg(age) as mean".green());
    println!();
}

fn format_value(value: &Value, indent: usize) -> String {
    let prefix = "  ".repeat(indent);
    match value {
        Value::Null => "null".dimmed().to_string(),
        Value::Bool(b) => if *b { "true".green() } else { "false".red() }.to_string(),
        Value::Number(n) => n.to_string().yellow().to_string(),
        Value::String(s) => format!("\"{}\"", s).green().to_string(),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items
                .iter()
                .map(|v| format!("{}  {}", prefix, format_value(v, indent + 1)))
                .collect();
            format!("[\n{}\n{}]", items.join(",\n"), prefix)
        }
        Value::Object(fields) if fields.is_empty() => "{}".to_string(),
        Value::Object(fields) => {
            let items: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}  {}: {}", prefix, k.cyan(), format_value(v, indent + 1)))
                .collect();
            format!("{{\n{}\n{}}}", items.join(",\n"), prefix)
        }
    }
}

struct Session {
    store: Store,
    tenant: TenantId,
    collection: String,
}

impl Session {
    /// Run one input line; `Ok(false)` ends the session.
    fn run(&mut self, line: &str) -> anyhow::Result<bool> {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            ":quit" | ":exit" | ":q" => return Ok(false),
            ":help" | ":h" => print_help(),
            ":insert" => {
                let document: Value = serde_json::from_str(rest)?;
                let inserted = self.store.insert(self.tenant, &self.collection, document)?;
                println!("{}", format_value(&Value::Array(inserted), 0));
            }
            ":get" => {
                let id: i64 = rest.parse()?;
                let document = self.store.get(self.tenant, &self.collection, id)?;
                println!("{}", format_value(&document, 0));
            }
            ":explain" => {
                let sql = self.store.explain(rest, &[])?;
                println!("{}", sql.statement().cyan());
                println!("{}", format_value(&Value::Array(sql.params), 0));
            }
            ":use" => {
                if rest.is_empty() {
                    println!("  {}", "Usage: :use <collection>".yellow());
                } else {
                    self.collection = rest.to_string();
                    println!("  {} {}", "Using collection:".dimmed(), rest.cyan());
                }
            }
            ":collections" => {
                for name in self.store.list_collections(self.tenant)? {
                    println!("  {}", name.cyan());
                }
            }
            other if other.starts_with(':') => {
                println!("  {} {}", "Unknown command:".red(), other);
                println!("  Type {} for help", ":help".yellow());
            }
            _ => {
                let selection = self.store.select(self.tenant, &self.collection, line, &[])?;
                for error in &selection.errors {
                    println!("  {} {}", "warning:".yellow(), error);
                }
                let count = selection.documents.len();
                println!("{}", format_value(&Value::Array(selection.documents), 0));
                println!("  {}", format!("{} result(s)", count).dimmed());
            }
        }
        Ok(true)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = StoreConfig::load(&args.config_dir)?;
    println!(
        "  {} {}",
        "jqlstore JQL REPL".white().bold(),
        env!("CARGO_PKG_VERSION").dimmed()
    );
    println!("  {} {}", "Storage:".dimmed(), config.mode.to_string().white());
    println!("  Type {} for help, {} to quit\n", ":help".yellow(), ":quit".yellow());

    let mut session = Session {
        store: Store::open(config)?,
        tenant: args.tenant,
        collection: args.collection,
    };

    let mut rl = Editor::new()?;
    rl.set_helper(Some(JqlHelper::new()));

    let history_file = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".jql_history"))
        .unwrap_or_else(|_| std::path::PathBuf::from(".jql_history"));
    let _ = rl.load_history(&history_file);

    loop {
        let prompt = format!("{}{} ", session.collection.cyan(), ">".white());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match session.run(line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("  {} {}", "Error:".red().bold(), e),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                println!("{} {}", "Error:".red(), e);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_file);
    session.store.shutdown()?;
    println!("{}", "Goodbye!".dimmed());
    Ok(())
}
