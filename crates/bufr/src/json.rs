//! JSON form of a message, round-trippable through the encoder.

use bufr_core::{BufrError, BufrMessage, Section0, Section1, Section2, Section3, TemplateData, Value};
use serde_json::{json, Value as Json};

/// Serialises a decoded message to the JSON form.
pub fn message_to_json(message: &BufrMessage) -> Result<Json, BufrError> {
    let data = message.template_data.as_ref().ok_or_else(|| {
        BufrError::MalformedHeader("message carries no template data".into())
    })?;
    let values: Vec<Json> = data
        .values_all_subsets()
        .iter()
        .map(|subset| Json::Array(subset.iter().map(value_to_json).collect()))
        .collect();
    Ok(json!({
        "edition": message.section0.edition,
        "section1": {
            "master_table": message.section1.master_table,
            "originating_centre": message.section1.originating_centre,
            "originating_subcentre": message.section1.originating_subcentre,
            "update_sequence": message.section1.update_sequence,
            "flags": message.section1.flags,
            "data_category": message.section1.data_category,
            "intl_subcategory": message.section1.intl_subcategory,
            "local_subcategory": message.section1.local_subcategory,
            "master_version": message.section1.master_version,
            "local_version": message.section1.local_version,
            "year": message.section1.year,
            "month": message.section1.month,
            "day": message.section1.day,
            "hour": message.section1.hour,
            "minute": message.section1.minute,
            "second": message.section1.second,
            "extra": message.section1.extra,
        },
        "section2": message.section2.as_ref().map(|s| s.data.clone()),
        "section3": {
            "n_subsets": message.section3.n_subsets,
            "flags": message.section3.flags,
            "unexpanded_descriptors": message.section3.unexpanded_descriptors
                .iter()
                .map(|id| format!("{id:06}"))
                .collect::<Vec<_>>(),
        },
        "values": values,
    }))
}

/// Rebuilds encoder input from the JSON form.
pub fn message_from_json(json: &Json) -> Result<BufrMessage, BufrError> {
    let bad = |msg: &str| BufrError::MalformedHeader(format!("json message: {msg}"));

    let edition = field(json, "edition")?
        .as_u64()
        .ok_or_else(|| bad("edition"))? as u8;
    let s1 = field(json, "section1")?;
    let u8_of = |key: &str| -> Result<u8, BufrError> {
        Ok(field(s1, key)?.as_u64().ok_or_else(|| bad(key))? as u8)
    };
    let u16_of = |key: &str| -> Result<u16, BufrError> {
        Ok(field(s1, key)?.as_u64().ok_or_else(|| bad(key))? as u16)
    };
    let section1 = Section1 {
        length: 0,
        master_table: u8_of("master_table")?,
        originating_centre: u16_of("originating_centre")?,
        originating_subcentre: u16_of("originating_subcentre")?,
        update_sequence: u8_of("update_sequence")?,
        flags: u8_of("flags")?,
        data_category: u8_of("data_category")?,
        intl_subcategory: u8_of("intl_subcategory")?,
        local_subcategory: u8_of("local_subcategory")?,
        master_version: u8_of("master_version")?,
        local_version: u8_of("local_version")?,
        year: u16_of("year")?,
        month: u8_of("month")?,
        day: u8_of("day")?,
        hour: u8_of("hour")?,
        minute: u8_of("minute")?,
        second: u8_of("second")?,
        extra: byte_array(field(s1, "extra")?).ok_or_else(|| bad("extra"))?,
    };

    let section2 = match field(json, "section2")? {
        Json::Null => None,
        other => Some(Section2 {
            length: 0,
            data: byte_array(other).ok_or_else(|| bad("section2"))?,
        }),
    };

    let s3 = field(json, "section3")?;
    let n_subsets = field(s3, "n_subsets")?
        .as_u64()
        .ok_or_else(|| bad("n_subsets"))? as u16;
    let flags = field(s3, "flags")?.as_u64().ok_or_else(|| bad("flags"))? as u8;
    let descriptors = field(s3, "unexpanded_descriptors")?
        .as_array()
        .ok_or_else(|| bad("unexpanded_descriptors"))?
        .iter()
        .map(|entry| match entry {
            Json::String(s) => s.parse::<u32>().map_err(|_| bad("descriptor id")),
            Json::Number(n) => n
                .as_u64()
                .map(|v| v as u32)
                .ok_or_else(|| bad("descriptor id")),
            _ => Err(bad("descriptor id")),
        })
        .collect::<Result<Vec<u32>, BufrError>>()?;
    let section3 = Section3 {
        length: 0,
        n_subsets,
        flags,
        unexpanded_descriptors: descriptors,
    };

    let values = field(json, "values")?
        .as_array()
        .ok_or_else(|| bad("values"))?
        .iter()
        .map(|subset| {
            subset
                .as_array()
                .ok_or_else(|| bad("subset values"))?
                .iter()
                .map(json_to_value)
                .collect::<Result<Vec<Value>, BufrError>>()
        })
        .collect::<Result<Vec<Vec<Value>>, BufrError>>()?;
    if values.len() != n_subsets as usize {
        return Err(bad("one value list per subset required"));
    }

    let is_compressed = section3.is_compressed();
    Ok(BufrMessage {
        section0: Section0 {
            total_length: 0,
            edition,
        },
        section1,
        section2,
        section3,
        section4_length: 0,
        template_data: Some(TemplateData::from_values(
            is_compressed,
            n_subsets as usize,
            values,
        )),
        serialized: Vec::new(),
    })
}

fn field<'j>(json: &'j Json, key: &str) -> Result<&'j Json, BufrError> {
    json.get(key)
        .ok_or_else(|| BufrError::MalformedHeader(format!("json message: missing field {key}")))
}

fn byte_array(json: &Json) -> Option<Vec<u8>> {
    json.as_array()?
        .iter()
        .map(|v| v.as_u64().map(|b| b as u8))
        .collect()
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Missing => Json::Null,
        Value::Int(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Str(s) => json!(s),
        Value::Bytes(b) => json!({ "bytes": b }),
    }
}

fn json_to_value(json: &Json) -> Result<Value, BufrError> {
    match json {
        Json::Null => Ok(Value::Missing),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(Value::Int(v))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or_default()))
            }
        }
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Object(map) => {
            let bytes = map
                .get("bytes")
                .and_then(byte_array)
                .ok_or_else(|| BufrError::MalformedHeader("json message: bad value".into()))?;
            Ok(Value::Bytes(bytes))
        }
        _ => Err(BufrError::MalformedHeader(
            "json message: unsupported value".into(),
        )),
    }
}
