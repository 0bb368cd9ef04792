//! SOPHIA - Interactive Shell
//! Line-oriented shell over an embedded Sophia store.
//!
//! Usage: `sophia [data_dir]` (defaults to `./data`).

use std::io::{self, BufRead, Write};

use sophia::{Database, OpenMode, Order, SophiaError};

fn show(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => format!("\"{}\"", s),
        Err(_) => format!("<{} bytes binary>", bytes.len()),
    }
}

fn main() {
    env_logger::init();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║           SOPHIA Storage Engine           ║");
    println!("  ║      Embedded Ordered Key-Value Store     ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>  - Store a key-value pair");
    println!("    get <key>          - Retrieve a value by key");
    println!("    del <key>          - Delete a key");
    println!("    has <key>          - Check whether a key exists");
    println!("    scan [op key]      - List pairs, optionally from a cursor (op: == > >= < <=)");
    println!("    flush              - Persist the MemTable to an SSTable");
    println!("    compact            - Merge all SSTables");
    println!("    info               - Show engine statistics");
    println!("    exit               - Shutdown engine");
    println!();

    let db = match Database::open(&data_dir, OpenMode::Create) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("[ERROR] Failed to open store at {}: {}", data_dir, err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("sophia> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                match db.set(parts[1], parts[2..].join(" ")) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match db.get(parts[1]) {
                    Ok(value) => println!("  {}", show(&value)),
                    Err(SophiaError::KeyNotFound) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match db.delete(parts[1]) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(SophiaError::KeyNotFound) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "has" | "exists" => {
                if parts.len() < 2 {
                    println!("  Usage: has <key>");
                    continue;
                }
                match db.exists(parts[1]) {
                    Ok(found) => println!("  {}", found),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "scan" | "list" => {
                let entries = match parts.len() {
                    1 => db.scan(),
                    3 => parts[1]
                        .parse::<Order>()
                        .and_then(|order| db.cursor(order, parts[2]))
                        .and_then(|cursor| cursor.collect()),
                    _ => {
                        println!("  Usage: scan [op key]");
                        continue;
                    }
                };
                match entries {
                    Ok(entries) if entries.is_empty() => println!("  (empty)"),
                    Ok(entries) => {
                        for (key, value) in &entries {
                            println!("  {} -> {}", show(key), show(value));
                        }
                        println!("  ({} entries)", entries.len());
                    }
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "flush" => match db.flush() {
                Ok(()) => println!("  OK"),
                Err(e) => println!("  ERROR: {}", e),
            },
            "compact" => match db.compact() {
                Ok(()) => println!("  OK"),
                Err(e) => println!("  ERROR: {}", e),
            },
            "info" | "stats" => {
                println!("  Path:          {}", db.path().display());
                match (db.table_count(), db.memtable_size()) {
                    (Ok(tables), Ok(size)) => {
                        println!("  SSTables:      {}", tables);
                        println!("  MemTable size: {} bytes", size);
                    }
                    (Err(e), _) | (_, Err(e)) => println!("  ERROR: {}", e),
                }
                println!("{}", db.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down SOPHIA...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(err) = db.close() {
        eprintln!("[ERROR] Failed to close store: {}", err);
        std::process::exit(1);
    }
}
