//! End-to-end decode scenarios over hand-assembled messages.

mod common;

use bufr_core::{AttrKind, BufrError, Decoder, NodeKind, Value};
use common::{build_message, COMPRESSED, OBSERVED};

#[test]
fn single_subset_two_elements() {
    let input = build_message(&[1001, 1002], 1, OBSERVED, |w| {
        w.write_uint(2, 7).unwrap();
        w.write_uint(4, 10).unwrap();
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    assert_eq!(data.values(0), &[Value::Int(2), Value::Int(4)]);
    assert_eq!(
        data.descriptors(0)
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>(),
        vec!["001001", "001002"]
    );
}

#[test]
fn associated_field_precedes_element() {
    let input = build_message(&[204_008, 31021, 12001, 204_000], 1, OBSERVED, |w| {
        w.write_uint(1, 6).unwrap(); // 031021: 1 bit indicator of quality
        w.write_uint(3, 8).unwrap(); // associated bits
        w.write_uint(2731, 12).unwrap(); // 012001 raw
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();

    assert_eq!(
        data.descriptors(0)
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>(),
        vec!["031021", "A12001", "012001"]
    );
    assert_eq!(
        data.values(0),
        &[Value::Int(1), Value::Int(3), Value::Float(273.1)]
    );

    let wired = data.wired().unwrap();
    let roots = &wired.roots_all_subsets[0];
    // 204008, 031021, 012001, 204000
    assert_eq!(roots.len(), 4);
    let element = wired.arena.get(roots[2]);
    assert_eq!(element.descriptor_id, 12001);
    let (kind, assoc_id) = element.attributes[0];
    assert_eq!(kind, AttrKind::Associated);
    let assoc = wired.arena.get(assoc_id);
    assert_eq!(data.values(0)[assoc.flat_index.unwrap()], Value::Int(3));
    // The associated node carries the 031021 significance as its meaning.
    let (kind, meaning_id) = assoc.attributes[0];
    assert_eq!(kind, AttrKind::Meaning);
    assert_eq!(wired.arena.get(meaning_id).descriptor_id, 31021);
}

#[test]
fn associated_field_without_significance_is_rejected() {
    let input = build_message(&[204_008, 12001, 204_000], 1, OBSERVED, |w| {
        w.write_uint(3, 8).unwrap();
        w.write_uint(2731, 12).unwrap();
    });
    let mut decoder = Decoder::new();
    let error = decoder.decode(&input).unwrap_err();
    let rendered = error.to_string();
    assert!(rendered.contains("031021"), "diagnostic was: {rendered}");
}

#[test]
fn delayed_replication_reads_factor_once() {
    let input = build_message(&[101_000, 31001, 8042], 1, OBSERVED, |w| {
        w.write_uint(3, 8).unwrap(); // factor
        for v in [1u64, 2, 4] {
            w.write_uint(v, 18).unwrap();
        }
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    assert_eq!(
        data.values(0),
        &[Value::Int(3), Value::Int(1), Value::Int(2), Value::Int(4)]
    );

    let wired = data.wired().unwrap();
    let replication = wired.arena.get(wired.roots_all_subsets[0][0]);
    assert_eq!(replication.kind, NodeKind::DelayedReplication);
    assert_eq!(replication.members.len(), 3);
    let factor = wired.arena.get(replication.factor.unwrap());
    assert_eq!(data.values(0)[factor.flat_index.unwrap()], Value::Int(3));
}

#[test]
fn compressed_subsets_share_minimum_and_deltas() {
    let input = build_message(&[1001], 4, OBSERVED | COMPRESSED, |w| {
        w.write_uint(0, 7).unwrap(); // minimum
        w.write_uint(3, 6).unwrap(); // delta width
        for delta in [1u64, 2, 3, 4] {
            w.write_uint(delta, 3).unwrap();
        }
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    for (idx, expected) in [1i64, 2, 3, 4].into_iter().enumerate() {
        assert_eq!(data.values(idx), &[Value::Int(expected)]);
    }
}

#[test]
fn compressed_all_missing_column() {
    let input = build_message(&[1001], 3, OBSERVED | COMPRESSED, |w| {
        w.write_uint(0x7f, 7).unwrap(); // all-ones minimum
        w.write_uint(0, 6).unwrap();
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    for idx in 0..3 {
        assert_eq!(data.values(idx), &[Value::Missing]);
    }
}

#[test]
fn quality_info_bitmap_attaches_to_candidates() {
    let descriptors = [1001, 1002, 12001, 222_000, 101_003, 31031, 33007, 33007];
    let input = build_message(&descriptors, 1, OBSERVED, |w| {
        w.write_uint(2, 7).unwrap();
        w.write_uint(4, 10).unwrap();
        w.write_uint(2731, 12).unwrap();
        // bitmap 0 1 0: candidates 001001 and 012001 selected
        for bit in [0u64, 1, 0] {
            w.write_uint(bit, 1).unwrap();
        }
        w.write_uint(85, 7).unwrap();
        w.write_uint(99, 7).unwrap();
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    let wired = data.wired().unwrap();
    let roots = &wired.roots_all_subsets[0];

    let first = wired.arena.get(roots[0]);
    assert_eq!(first.descriptor_id, 1001);
    let (kind, qa_id) = first.attributes[0];
    assert_eq!(kind, AttrKind::QualityInfo);
    assert_eq!(
        data.values(0)[wired.arena.get(qa_id).flat_index.unwrap()],
        Value::Int(85)
    );

    let third = wired.arena.get(roots[2]);
    assert_eq!(third.descriptor_id, 12001);
    let (kind, qa_id) = third.attributes[0];
    assert_eq!(kind, AttrKind::QualityInfo);
    assert_eq!(
        data.values(0)[wired.arena.get(qa_id).flat_index.unwrap()],
        Value::Int(99)
    );

    // The skipped candidate keeps no attributes.
    assert!(wired.arena.get(roots[1]).attributes.is_empty());
}

#[test]
fn more_markers_than_bitmap_zeros_is_a_mismatch() {
    let descriptors = [1001, 1002, 12001, 222_000, 101_003, 31031, 33007, 33007, 33007];
    let input = build_message(&descriptors, 1, OBSERVED, |w| {
        w.write_uint(2, 7).unwrap();
        w.write_uint(4, 10).unwrap();
        w.write_uint(2731, 12).unwrap();
        for bit in [0u64, 1, 0] {
            w.write_uint(bit, 1).unwrap();
        }
        w.write_uint(85, 7).unwrap();
        w.write_uint(99, 7).unwrap();
        w.write_uint(12, 7).unwrap();
    });
    let mut decoder = Decoder::new();
    let error = decoder.decode(&input).unwrap_err();
    assert!(
        matches!(
            &error,
            BufrError::Walk { source, .. } if matches!(**source, BufrError::BitmapMismatch(_))
        ),
        "got {error:?}"
    );
}

#[test]
fn corrupted_terminator_fails_validation() {
    let mut input = build_message(&[1001], 1, OBSERVED, |w| {
        w.write_uint(2, 7).unwrap();
    });
    let len = input.len();
    input[len - 4..].copy_from_slice(b"7776");
    let mut decoder = Decoder::new();
    assert!(matches!(
        decoder.decode(&input),
        Err(BufrError::ValidationFailed { .. })
    ));
}

#[test]
fn corrupted_terminator_tolerated_on_request() {
    let mut input = build_message(&[1001], 1, OBSERVED, |w| {
        w.write_uint(2, 7).unwrap();
    });
    let len = input.len();
    input[len - 4..].copy_from_slice(b"7776");
    let mut decoder = Decoder::new();
    let options = bufr_core::DecodeOptions {
        ignore_value_expectation: true,
        ..Default::default()
    };
    let message = decoder.decode_with_options(&input, &options).unwrap();
    assert_eq!(
        message.template_data.as_ref().unwrap().values(0),
        &[Value::Int(2)]
    );
}

#[test]
fn missing_numeric_value_decodes_to_missing() {
    let input = build_message(&[12001], 1, OBSERVED, |w| {
        w.write_uint(0xfff, 12).unwrap();
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    assert_eq!(data.values(0), &[Value::Missing]);
}

#[test]
fn bit_accounting_matches_declared_lengths() {
    let input = build_message(&[1001, 1002], 2, OBSERVED, |w| {
        for _ in 0..2 {
            w.write_uint(1, 7).unwrap();
            w.write_uint(2, 10).unwrap();
        }
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    assert_eq!(message.serialized.len(), message.section0.total_length);
    assert_eq!(message.serialized, input);
}

#[test]
fn truncated_payload_reports_insufficient_bits() {
    // Template wants 17 bits of data; supply a single octet.
    let mut input = build_message(&[1001, 1002], 1, OBSERVED, |w| {
        w.write_uint(1, 7).unwrap();
        w.write_uint(2, 10).unwrap();
    });
    // Chop the message after the first payload octet and restate section
    // and total lengths so only the bit reader can notice.
    let mut decoder = Decoder::new();
    input.truncate(input.len() - 8);
    let error = decoder.decode(&input).unwrap_err();
    assert!(
        matches!(
            &error,
            BufrError::Walk { source, .. }
                if matches!(**source, BufrError::InsufficientBits(_))
        ) || matches!(error, BufrError::InsufficientBits(_)),
        "got {error:?}"
    );
}

#[test]
fn unknown_descriptor_is_reported_with_trail() {
    let input = build_message(&[48_192], 1, OBSERVED, |w| {
        w.write_uint(0, 8).unwrap();
    });
    let mut decoder = Decoder::new();
    let error = decoder.decode(&input).unwrap_err();
    assert!(error.to_string().contains("048192"), "got {error}");
}

#[test]
fn multiple_messages_in_one_stream() {
    let one = build_message(&[1001], 1, OBSERVED, |w| {
        w.write_uint(7, 7).unwrap();
    });
    let two = build_message(&[1002], 1, OBSERVED, |w| {
        w.write_uint(300, 10).unwrap();
    });
    let mut stream = Vec::new();
    stream.extend_from_slice(b"leading junk");
    stream.extend_from_slice(&one);
    stream.extend_from_slice(&two);

    let mut decoder = Decoder::new();
    let messages = decoder.decode_all(&stream).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[0].template_data.as_ref().unwrap().values(0),
        &[Value::Int(7)]
    );
    assert_eq!(
        messages[1].template_data.as_ref().unwrap().values(0),
        &[Value::Int(300)]
    );
}

#[test]
fn info_only_skips_template_data() {
    let input = build_message(&[1001], 1, OBSERVED, |w| {
        w.write_uint(2, 7).unwrap();
    });
    let mut decoder = Decoder::new();
    let options = bufr_core::DecodeOptions {
        info_only: true,
        ..Default::default()
    };
    let message = decoder.decode_with_options(&input, &options).unwrap();
    assert!(message.template_data.is_none());
    assert_eq!(message.section3.unexpanded_descriptors, vec![1001]);
}
