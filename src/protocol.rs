use std::io;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::ser::{Formatter, Serializer};

use crate::error::ProtocolError;

/// A geographic/orientation sample attached to every message.
///
/// The wire labels are crossed: `longitude` travels as `"lat"` and `latitude`
/// as `"lon"`. Existing clients depend on this, so it must not be "fixed".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(rename = "lat")]
    pub longitude: f64,
    #[serde(rename = "lon")]
    pub latitude: f64,
    #[serde(rename = "alt")]
    pub altitude: f64,
    /// Degrees, 0-360 by convention. Not range checked.
    pub heading: f64,
}

impl Position {
    pub fn new(longitude: f64, latitude: f64, altitude: f64, heading: f64) -> Self {
        Self {
            longitude,
            latitude,
            altitude,
            heading,
        }
    }

    /// First coordinate that cannot be put on the wire, by wire label.
    fn non_finite(&self) -> Option<(&'static str, f64)> {
        [
            ("lat", self.longitude),
            ("lon", self.latitude),
            ("alt", self.altitude),
            ("heading", self.heading),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite())
    }
}

/// One unit of broadcast. Every frame on the wire is a single compact JSON
/// object of this shape followed by a newline character (\n).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub email: String,
    pub username: String,
    pub message: String,
    pub position: Position,
}

impl Message {
    pub fn new(
        email: impl Into<String>,
        username: impl Into<String>,
        message: impl Into<String>,
        position: Position,
    ) -> Self {
        Self {
            email: email.into(),
            username: username.into(),
            message: message.into(),
            position,
        }
    }

    /// Serializes the message without the framing newline.
    ///
    /// Output is byte-compatible with the existing clients' encoder: whole
    /// numbers carry no fraction (`1`, not `1.0`), very large and very small
    /// magnitudes switch to exponent form, and `<`, `>`, `&`, U+2028 and
    /// U+2029 are written as `\u` escapes. Non-finite coordinates are rejected.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if let Some((field, value)) = self.position.non_finite() {
            return Err(ProtocolError::UnsupportedValue { field, value });
        }
        let mut out = Vec::with_capacity(128);
        let mut ser = Serializer::with_formatter(&mut out, WireFormatter);
        self.serialize(&mut ser).map_err(ProtocolError::Encode)?;
        Ok(Bytes::from(out))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame.trim_ascii()).map_err(ProtocolError::Decode)
    }
}

/// Compact JSON with the number and string rules of the wire format.
struct WireFormatter;

impl Formatter for WireFormatter {
    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(format_float(value).as_bytes())
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let bytes = fragment.as_bytes();
        let mut start = 0;
        for (i, c) in fragment.char_indices() {
            let escape = match c {
                '<' => "\\u003c",
                '>' => "\\u003e",
                '&' => "\\u0026",
                '\u{2028}' => "\\u2028",
                '\u{2029}' => "\\u2029",
                _ => continue,
            };
            writer.write_all(&bytes[start..i])?;
            writer.write_all(escape.as_bytes())?;
            start = i + c.len_utf8();
        }
        writer.write_all(&bytes[start..])
    }
}

/// Shortest round-trip representation; plain decimal for magnitudes in
/// [1e-6, 1e21), otherwise `d.ddde-N` / `d.ddde+NN`.
fn format_float(value: f64) -> String {
    let abs = value.abs();
    if abs == 0.0 || (1e-6..1e21).contains(&abs) {
        return value.to_string();
    }
    let sci = format!("{value:e}");
    match sci.split_once('e') {
        Some((mantissa, exp)) if exp.starts_with('-') => format!("{mantissa}e{exp}"),
        Some((mantissa, exp)) => format!("{mantissa}e+{exp:0>2}"),
        None => sci,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new("a@x", "a", "hi", Position::new(1.0, 2.0, 3.0, 4.0))
    }

    #[test]
    fn encodes_fixed_labels_in_fixed_order() {
        let bytes = sample().encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"email":"a@x","username":"a","message":"hi","position":{"lat":1,"lon":2,"alt":3,"heading":4}}"#
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = sample();
        assert_eq!(msg.encode().unwrap(), msg.encode().unwrap());
    }

    #[test]
    fn decode_maps_crossed_labels_back() {
        let msg = Message::decode(
            br#"{"email":"b@x","username":"b","message":"yo","position":{"lat":10.5,"lon":-3.25,"alt":0,"heading":270}}"#,
        )
        .unwrap();
        assert_eq!(msg.position.longitude, 10.5);
        assert_eq!(msg.position.latitude, -3.25);
        assert_eq!(msg.position.heading, 270.0);
    }

    #[test]
    fn decode_tolerates_carriage_return() {
        let mut frame = sample().encode().unwrap().to_vec();
        frame.extend_from_slice(b"\r\n");
        assert_eq!(Message::decode(&frame).unwrap(), sample());
    }

    #[test]
    fn decode_rejects_missing_position() {
        let err = Message::decode(br#"{"email":"a@x","username":"a","message":"hi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn html_sensitive_characters_are_escaped() {
        let msg = Message::new("a@x", "a", "<3 & hi>", Position::new(1.0, 2.0, 3.0, 4.0));
        let bytes = msg.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"email":"a@x","username":"a","message":"\u003c3 \u0026 hi\u003e","position":{"lat":1,"lon":2,"alt":3,"heading":4}}"#
        );
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn line_separators_and_controls_are_escaped() {
        let msg = Message::new("a@x", "a", "a\u{2028}b\n\"c\u{1}", Position::default());
        let bytes = msg.encode().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""message":"a\u2028b\n\"c\u0001""#), "{text}");
    }

    #[test]
    fn floats_use_shortest_form() {
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(-0.0), "-0");
        assert_eq!(format_float(-122.4194), "-122.4194");
        assert_eq!(format_float(359.5), "359.5");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(0.000001), "0.000001");
        assert_eq!(format_float(1e20), "100000000000000000000");
    }

    #[test]
    fn extreme_magnitudes_use_exponent_form() {
        assert_eq!(format_float(1e21), "1e+21");
        assert_eq!(format_float(1.5e300), "1.5e+300");
        assert_eq!(format_float(1e-7), "1e-7");
        assert_eq!(format_float(-2.5e-10), "-2.5e-10");
    }

    #[test]
    fn non_finite_position_is_rejected() {
        let msg = Message::new("a@x", "a", "hi", Position::new(f64::NAN, 2.0, f64::INFINITY, 4.0));
        match msg.encode() {
            Err(ProtocolError::UnsupportedValue { field, value }) => {
                assert_eq!(field, "lat");
                assert!(value.is_nan());
            }
            other => panic!("expected UnsupportedValue, got {other:?}"),
        }

        let msg = Message::new("a@x", "a", "hi", Position::new(0.0, 0.0, 0.0, f64::NEG_INFINITY));
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::UnsupportedValue { field: "heading", .. })
        ));
    }
}
