//! Facade-level coverage: JSON round-trips, path queries and rendering.

use bufr::json::{message_from_json, message_to_json};
use bufr::render::render_text;
use bufr::{DataQuerent, Decoder, Encoder, Value};
use serde_json::json;

fn encode_json(message: serde_json::Value) -> Vec<u8> {
    let message = message_from_json(&message).unwrap();
    Encoder::new().encode(&message).unwrap()
}

fn section1_json() -> serde_json::Value {
    json!({
        "master_table": 0,
        "originating_centre": 74,
        "originating_subcentre": 0,
        "update_sequence": 0,
        "flags": 0,
        "data_category": 0,
        "intl_subcategory": 255,
        "local_subcategory": 255,
        "master_version": 25,
        "local_version": 0,
        "year": 2021,
        "month": 6,
        "day": 1,
        "hour": 12,
        "minute": 30,
        "second": 0,
        "extra": [],
    })
}

fn surface_message() -> serde_json::Value {
    json!({
        "edition": 4,
        "section1": section1_json(),
        "section2": null,
        "section3": {
            "n_subsets": 1,
            "flags": 128,
            "unexpanded_descriptors": ["301001", "101003", "012001"],
        },
        "values": [[2, 704, 250.1, 255.0, 260.3]],
    })
}

#[test]
fn json_form_encodes_and_decodes_back() {
    let bytes = encode_json(surface_message());
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();
    let data = message.template_data.as_ref().unwrap();
    assert_eq!(
        data.values(0),
        &[
            Value::Int(2),
            Value::Int(704),
            Value::Float(250.1),
            Value::Float(255.0),
            Value::Float(260.3),
        ]
    );

    let round = message_to_json(&message).unwrap();
    assert_eq!(round["edition"], json!(4));
    assert_eq!(round["section3"]["n_subsets"], json!(1));
    assert_eq!(
        round["section3"]["unexpanded_descriptors"],
        json!(["301001", "101003", "012001"])
    );
    assert_eq!(round["values"], surface_message()["values"]);

    // The JSON form re-encodes to the identical bytes.
    assert_eq!(encode_json(round), bytes);
}

#[test]
fn query_child_path_inside_sequence() {
    let bytes = encode_json(surface_message());
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();

    let querent = DataQuerent::new();
    let result = querent.query(&message, "/301001/001001").unwrap();
    assert_eq!(result.flat_values(0), vec![Value::Int(2)]);
}

#[test]
fn query_descend_collects_replicated_values() {
    let bytes = encode_json(surface_message());
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();

    let querent = DataQuerent::new();
    let result = querent.query(&message, ">012001").unwrap();
    assert_eq!(
        result.flat_values(0),
        vec![
            Value::Float(250.1),
            Value::Float(255.0),
            Value::Float(260.3)
        ]
    );

    // A bare id behaves as a descend from the root.
    let bare = querent.query(&message, "012001").unwrap();
    assert_eq!(bare.flat_values(0), result.flat_values(0));
}

#[test]
fn query_factor_as_attribute_of_replication() {
    let message_json = json!({
        "edition": 4,
        "section1": section1_json(),
        "section2": null,
        "section3": {
            "n_subsets": 1,
            "flags": 128,
            "unexpanded_descriptors": ["101000", "031001", "012001"],
        },
        "values": [[3, 250.1, 255.0, 260.3]],
    });
    let bytes = encode_json(message_json);
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();

    let querent = DataQuerent::new();
    let result = querent.query(&message, "/101000.031001").unwrap();
    assert_eq!(result.flat_values(0), vec![Value::Int(3)]);
}

#[test]
fn query_associated_field_attribute() {
    let message_json = json!({
        "edition": 4,
        "section1": section1_json(),
        "section2": null,
        "section3": {
            "n_subsets": 1,
            "flags": 128,
            "unexpanded_descriptors": ["204008", "031021", "012001", "204000"],
        },
        "values": [[1, 3, 273.1]],
    });
    let bytes = encode_json(message_json);
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();

    let querent = DataQuerent::new();
    let result = querent.query(&message, "012001.A12001").unwrap();
    assert_eq!(result.flat_values(0), vec![Value::Int(3)]);
}

#[test]
fn query_subset_selection() {
    let message_json = json!({
        "edition": 4,
        "section1": section1_json(),
        "section2": null,
        "section3": {
            "n_subsets": 2,
            "flags": 128,
            "unexpanded_descriptors": ["001001"],
        },
        "values": [[7], [8]],
    });
    let bytes = encode_json(message_json);
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();

    let querent = DataQuerent::new();
    let result = querent.query(&message, "@[1]/001001").unwrap();
    assert_eq!(result.subset_indices(), vec![1]);
    assert_eq!(result.flat_values(1), vec![Value::Int(8)]);

    let all = querent.query(&message, "001001").unwrap();
    assert_eq!(all.all_flat_values(), vec![vec![Value::Int(7)], vec![Value::Int(8)]]);
}

#[test]
fn render_text_shows_sections_and_values() {
    let bytes = encode_json(surface_message());
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();

    let rendered = render_text(&message);
    assert!(rendered.contains("number of subsets = 1"));
    assert!(rendered.contains("001001 WMO BLOCK NUMBER 2"));
    assert!(rendered.contains("TEMPERATURE/AIR TEMPERATURE"));
    assert!(rendered.contains("subset 1 of 1"));
}

#[test]
fn render_text_marks_missing_values() {
    let message_json = json!({
        "edition": 4,
        "section1": section1_json(),
        "section2": null,
        "section3": {
            "n_subsets": 1,
            "flags": 128,
            "unexpanded_descriptors": ["012001"],
        },
        "values": [[null]],
    });
    let bytes = encode_json(message_json);
    let mut decoder = Decoder::new();
    let message = decoder.decode(&bytes).unwrap();
    assert_eq!(
        message.template_data.as_ref().unwrap().values(0),
        &[Value::Missing]
    );
    assert!(render_text(&message).contains("None"));
}
