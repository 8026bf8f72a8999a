//! Interactive demo shell for a single embedded [`docdb::Database`].
//!
//! Generalizes `cryo`'s `cli.rs`/`prompt()` read-eval-print loop (read a
//! line, parse one [`cryo::cli::Command`], print the result) from a
//! SQL-flavored statement parser into a handful of fixed verbs over a
//! document collection. Not part of the library's tested surface — a thin
//! wrapper for kicking the tires from a terminal.
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use docdb::{DbConfig, Database, Predicate, Value};

#[derive(Parser)]
#[command(version, about = "Interactive shell for an embedded docdb database", long_about = None)]
struct Cli {
    /// Directory the database lives in (created if missing).
    #[arg(default_value = "./data")]
    path: PathBuf,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut db = match Database::open(&cli.path, DbConfig::default()) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("failed to open database at {}: {err}", cli.path.display());
            std::process::exit(1);
        }
    };

    println!("docdb shell — {}", cli.path.display());
    println!("commands: insert/get/all/count/delete/find/explain, .exit");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("docdb> ");
        if stdout.flush().is_err() {
            break;
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&mut db, line) {
            Ok(Some(output)) => println!("{output}"),
            Ok(None) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }

    if let Err(err) = db.close() {
        eprintln!("error closing database: {err}");
    }
}

fn run_command(db: &mut Database, line: &str) -> Result<Option<String>, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();

    match verb {
        ".exit" | ".quit" => Ok(None),
        "insert" => {
            let [collection, kvs @ ..] = rest.as_slice() else {
                return Err("usage: insert <collection> key=value [key=value ...]".to_string());
            };
            let fields = parse_fields(kvs)?;
            let id = db
                .insert(collection, collection, fields)
                .map_err(|e| e.to_string())?;
            Ok(Some(id))
        }
        "get" => {
            let [collection, id] = rest.as_slice() else {
                return Err("usage: get <collection> <id>".to_string());
            };
            let entity = db
                .collection(collection, collection)
                .map_err(|e| e.to_string())?
                .get(id)
                .map_err(|e| e.to_string())?;
            Ok(Some(match entity {
                Some(e) => format!("{:?}", e.fields),
                None => "not found".to_string(),
            }))
        }
        "all" => {
            let [collection] = rest.as_slice() else {
                return Err("usage: all <collection>".to_string());
            };
            let entities = db
                .collection(collection, collection)
                .map_err(|e| e.to_string())?
                .get_all()
                .map_err(|e| e.to_string())?;
            Ok(Some(format!("{} entit{}", entities.len(), plural(entities.len()))))
        }
        "count" => {
            let [collection] = rest.as_slice() else {
                return Err("usage: count <collection>".to_string());
            };
            let count = db
                .collection(collection, collection)
                .map_err(|e| e.to_string())?
                .count();
            Ok(Some(count.to_string()))
        }
        "delete" => {
            let [collection, id] = rest.as_slice() else {
                return Err("usage: delete <collection> <id>".to_string());
            };
            let deleted = db
                .delete(collection, collection, id)
                .map_err(|e| e.to_string())?;
            Ok(Some(deleted.to_string()))
        }
        "find" => {
            let (collection, predicate) = parse_equality(&rest)?;
            let entities = db
                .find(collection, collection, &predicate)
                .map_err(|e| e.to_string())?;
            Ok(Some(format!("{} entit{}", entities.len(), plural(entities.len()))))
        }
        "explain" => {
            let (collection, predicate) = parse_equality(&rest)?;
            let plan = db
                .collection(collection, collection)
                .map_err(|e| e.to_string())?
                .explain(&predicate);
            Ok(Some(format!("{plan:?}")))
        }
        other => Err(format!(
            "unknown command '{other}' (try insert/get/all/count/delete/find/explain, .exit)"
        )),
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "y" } else { "ies" }
}

fn parse_equality<'a>(rest: &[&'a str]) -> Result<(&'a str, Predicate), String> {
    let [collection, field, value] = rest else {
        return Err("usage: find|explain <collection> <field> <value>".to_string());
    };
    Ok((collection, Predicate::Equals((*field).to_string(), parse_value(value))))
}

fn parse_fields(kvs: &[&str]) -> Result<BTreeMap<String, Value>, String> {
    let mut fields = BTreeMap::new();
    for kv in kvs {
        let (key, value) = kv
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{kv}'"))?;
        fields.insert(key.to_string(), parse_value(value));
    }
    Ok(fields)
}

fn parse_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        Value::Bool(b)
    } else {
        Value::String(raw.to_string())
    }
}
