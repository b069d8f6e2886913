//! `bufr-query` — evaluate a path expression against BUFR messages.
//!
//! Usage:
//!   bufr-query '<path-expr>' [<file>]
//!
//! The path expression is the first argument; messages are read from the
//! file argument or stdin. Matching values are printed per subset.

use std::io::Read;

use bufr::{DataQuerent, Decoder};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let path_expr = match args.first() {
        Some(expr) => expr.clone(),
        None => {
            eprintln!("First argument must be a path expression.");
            std::process::exit(1);
        }
    };

    let input = match read_input(args.get(1)) {
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

    let querent = DataQuerent::new();
    for (i, message) in messages.iter().enumerate() {
        let result = match querent.query(message, &path_expr) {
            Ok(result) => result,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        };
        println!("# message {}", i + 1);
        for idx_subset in result.subset_indices() {
            let rendered: Vec<String> = result
                .flat_values(idx_subset)
                .iter()
                .map(|v| v.to_string())
                .collect();
            println!("subset {}: {}", idx_subset + 1, rendered.join(", "));
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
