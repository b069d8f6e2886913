//! `bufr-encode` — encode the JSON form back to a binary BUFR message.
//!
//! Usage:
//!   bufr-encode [<json-file>] [-o <output-file>]
//!
//! Reads the JSON form from the file argument or stdin and writes the
//! binary message to the output file or stdout.

use std::io::{Read, Write};

use bufr::{json::message_from_json, Encoder};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut input_path = None;
    let mut output_path = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            output_path = iter.next().cloned();
        } else {
            input_path = Some(arg.clone());
        }
    }

    let raw = match read_input(input_path.as_ref()) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let json = match serde_json::from_slice(&raw) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("invalid JSON input: {e}");
            std::process::exit(1);
        }
    };
    let message = match message_from_json(&json) {
        Ok(message) => message,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let bytes = match Encoder::new().encode(&message) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let result = match output_path {
        Some(path) => std::fs::write(path, &bytes),
        None => std::io::stdout().write_all(&bytes),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
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
