//! `bufr-decode` — decode BUFR messages to a readable dump or JSON.
//!
//! Usage:
//!   bufr-decode [--json] [<file>]
//!
//! Reads from the file argument, or stdin when absent. With `--json` the
//! output is the round-trippable JSON form, one document per message.

use std::io::Read;

use bufr::{json::message_to_json, render::render_text, Decoder};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let as_json = args.iter().any(|a| a == "--json");
    let path = args.iter().find(|a| !a.starts_with("--"));

    let input = match read_input(path) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let mut decoder = Decoder::new();
    let messages = match decoder.decode_all(&input) {
        Ok(messages) => messages,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    for message in &messages {
        if as_json {
            match message_to_json(message) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        } else {
            println!("{}", render_text(message));
        }
    }
}

fn read_input(path: Option<&String>) -> std::io::Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}
