//! `bufr-lookup` — show table entries for descriptor ids.
//!
//! Usage:
//!   bufr-lookup <id> [<id>...]
//!
//! Prints the Table B entry of element descriptors or the Table D expansion
//! of sequence descriptors, using the default tables.

use bufr::{TableGroupKey, Tables};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("Provide one or more six-digit descriptor ids.");
        std::process::exit(1);
    }

    let mut tables = Tables::new();
    let group = match tables.group(TableGroupKey::default()) {
        Ok(group) => group,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    for arg in &args {
        let id: u32 = match arg.parse() {
            Ok(id) => id,
            Err(_) => {
                eprintln!("{arg}: not a descriptor id");
                std::process::exit(1);
            }
        };
        if id >= 300_000 {
            match group.lookup_sequence_ids(id) {
                Ok(members) => {
                    let ids: Vec<String> = members.iter().map(|m| format!("{m:06}")).collect();
                    println!("{id:06} -> {}", ids.join(" "));
                }
                Err(e) => eprintln!("{e}"),
            }
        } else {
            match group.lookup_element(id) {
                Ok(element) => println!(
                    "{:06} {} | unit={} scale={} reference={} width={}",
                    element.id, element.name, element.unit, element.scale, element.refval,
                    element.nbits
                ),
                Err(e) => eprintln!("{e}"),
            }
        }
    }
}
