//! Cross-cutting invariants: operator scoping, compressed/uncompressed
//! equivalence and compiled/interpreted equivalence.

mod common;

use bufr_core::{Decoder, Encoder, Value};
use common::{build_message, COMPRESSED, OBSERVED};

#[test]
fn width_and_scale_operators_stop_at_cancellation() {
    // 201130/202129 widen 012001 to 14 bits and shift the scale to 2;
    // after the cancellations the same element reads 12 bits at scale 1.
    let descriptors = [201_130, 202_129, 12001, 201_000, 202_000, 12001];
    let input = build_message(&descriptors, 1, OBSERVED, |w| {
        w.write_uint(27315, 14).unwrap();
        w.write_uint(2731, 12).unwrap();
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    assert_eq!(
        data.values(0),
        &[Value::Float(273.15), Value::Float(273.1)]
    );
    let encoded = Encoder::new().encode(&message).unwrap();
    assert_eq!(encoded, input);
}

#[test]
fn operator_207_bumps_width_scale_and_reference() {
    // 207001: width +4, scale +1, reference x10. 007004 becomes 18 bits at
    // scale 0.
    let descriptors = [207_001, 7004, 207_000, 7004];
    let input = build_message(&descriptors, 1, OBSERVED, |w| {
        w.write_uint(101_325, 18).unwrap();
        w.write_uint(10_132, 14).unwrap();
    });
    let mut decoder = Decoder::new();
    let message = decoder.decode(&input).unwrap();
    let data = message.template_data.as_ref().unwrap();
    assert_eq!(
        data.values(0),
        &[Value::Int(101_325), Value::Float(101_320.0)]
    );
    let encoded = Encoder::new().encode(&message).unwrap();
    assert_eq!(encoded, input);
}

#[test]
fn compressed_and_uncompressed_content_decode_equally() {
    let descriptors = [1001, 12001];
    let uncompressed = build_message(&descriptors, 2, OBSERVED, |w| {
        for (block, temp) in [(3u64, 2700u64), (5, 2710)] {
            w.write_uint(block, 7).unwrap();
            w.write_uint(temp, 12).unwrap();
        }
    });
    let compressed = build_message(&descriptors, 2, OBSERVED | COMPRESSED, |w| {
        // 001001: min 3, deltas 0 and 2 in 2 bits
        w.write_uint(3, 7).unwrap();
        w.write_uint(2, 6).unwrap();
        w.write_uint(0, 2).unwrap();
        w.write_uint(2, 2).unwrap();
        // 012001: min 2700, deltas 0 and 10 in 4 bits
        w.write_uint(2700, 12).unwrap();
        w.write_uint(4, 6).unwrap();
        w.write_uint(0, 4).unwrap();
        w.write_uint(10, 4).unwrap();
    });

    let mut decoder = Decoder::new();
    let a = decoder.decode(&uncompressed).unwrap();
    let b = decoder.decode(&compressed).unwrap();
    let data_a = a.template_data.as_ref().unwrap();
    let data_b = b.template_data.as_ref().unwrap();
    for idx in 0..2 {
        assert_eq!(data_a.values(idx), data_b.values(idx));
        assert_eq!(
            data_a
                .descriptors(idx)
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>(),
            data_b
                .descriptors(idx)
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
        );
    }
}

/// Every message decoded both interpreted and compiled must agree, and the
/// compiled encoder must reproduce the exact bytes.
fn assert_compiled_equivalent(input: &[u8]) {
    let mut plain = Decoder::new();
    let mut compiled = Decoder::new().with_template_compilation(32);

    let a = plain.decode(input).unwrap();
    // Decode twice so the second run replays the cached template.
    let _ = compiled.decode(input).unwrap();
    let b = compiled.decode(input).unwrap();

    let data_a = a.template_data.as_ref().unwrap();
    let data_b = b.template_data.as_ref().unwrap();
    assert_eq!(data_a.n_subsets(), data_b.n_subsets());
    for idx in 0..data_a.n_subsets() {
        assert_eq!(data_a.values(idx), data_b.values(idx), "values diverge");
        assert_eq!(
            data_a
                .descriptors(idx)
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>(),
            data_b
                .descriptors(idx)
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>(),
            "descriptors diverge"
        );
    }

    let encoded = Encoder::new()
        .with_template_compilation(32)
        .encode(&b)
        .unwrap();
    assert_eq!(encoded, input, "compiled encode diverges");
}

#[test]
fn compiled_walk_matches_interpreted_walk() {
    let cases: Vec<Vec<u8>> = vec![
        build_message(&[1001, 1002, 2001], 1, OBSERVED, |w| {
            w.write_uint(11, 7).unwrap();
            w.write_uint(520, 10).unwrap();
            w.write_uint(1, 2).unwrap();
        }),
        build_message(&[101_000, 31001, 8042, 1001], 2, OBSERVED, |w| {
            // Different replication counts per subset.
            w.write_uint(2, 8).unwrap();
            w.write_uint(5, 18).unwrap();
            w.write_uint(9, 18).unwrap();
            w.write_uint(33, 7).unwrap();
            w.write_uint(0, 8).unwrap();
            w.write_uint(34, 7).unwrap();
        }),
        build_message(&[204_008, 31021, 12001, 204_000], 1, OBSERVED, |w| {
            w.write_uint(1, 6).unwrap();
            w.write_uint(3, 8).unwrap();
            w.write_uint(2731, 12).unwrap();
        }),
        build_message(&[203_015, 7004, 203_255, 7004, 203_000], 1, OBSERVED, |w| {
            w.write_int(-1000, 15).unwrap();
            w.write_uint(150, 14).unwrap();
        }),
        build_message(
            &[1001, 12001, 223_000, 101_002, 31031, 223_255, 223_255],
            1,
            OBSERVED,
            |w| {
                w.write_uint(2, 7).unwrap();
                w.write_uint(2731, 12).unwrap();
                w.write_uint(0, 1).unwrap();
                w.write_uint(0, 1).unwrap();
                w.write_uint(5, 7).unwrap();
                w.write_uint(2732, 12).unwrap();
            },
        ),
        build_message(&[1001], 4, OBSERVED | COMPRESSED, |w| {
            w.write_uint(0, 7).unwrap();
            w.write_uint(3, 6).unwrap();
            for delta in [1u64, 2, 3, 4] {
                w.write_uint(delta, 3).unwrap();
            }
        }),
        build_message(&[201_130, 202_129, 12001, 201_000, 202_000, 12001], 1, OBSERVED, |w| {
            w.write_uint(27315, 14).unwrap();
            w.write_uint(2731, 12).unwrap();
        }),
    ];
    for input in &cases {
        assert_compiled_equivalent(input);
    }
}

#[test]
fn templates_with_221_over_replications_fall_back_to_interpretation() {
    // The compiler declines this shape; decoding must still succeed and
    // agree with the plain walk.
    let descriptors = [221_003, 10004, 102_002, 12001, 13003, 1001];
    let input = build_message(&descriptors, 1, OBSERVED, |w| {
        // 010004 and the first-repetition 012001 fall under the 221 count;
        // everything else carries bits.
        w.write_uint(40, 7).unwrap(); // 013003 of the first repetition
        w.write_uint(2731, 12).unwrap(); // second repetition
        w.write_uint(55, 7).unwrap();
        w.write_uint(9, 7).unwrap(); // 001001
    });
    let mut plain = Decoder::new();
    let mut compiled = Decoder::new().with_template_compilation(8);
    let a = plain.decode(&input).unwrap();
    let b = compiled.decode(&input).unwrap();
    assert_eq!(
        a.template_data.as_ref().unwrap().values(0),
        b.template_data.as_ref().unwrap().values(0)
    );
}
