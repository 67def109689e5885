//! Column-value formatting. Oracle's on-disk representations (packed
//! decimal, 7-byte date, raw text) become portable strings at emit time.

use log::warn;

/// Appends one column value, selected by the dictionary type number.
/// Unknown types render as `?`; undecodable encodings are skipped behind
/// a diagnostic.
pub fn append_value(out: &mut String, type_no: u32, data: &[u8]) {
    match type_no {
        // varchar2 / char
        1 | 96 => append_escaped(out, data),
        // number
        2 => append_number(out, data),
        // date / timestamp
        12 | 180 => append_date(out, type_no, data),
        _ => out.push('?'),
    }
}

/// JSON-style escaping for text payloads.
pub fn append_escaped(out: &mut String, data: &[u8]) {
    for &b in data {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x08 => out.push_str("\\b"),
            0x0C => out.push_str("\\f"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b < 0x20 => out.push_str(&format!("\\u{:04x}", b)),
            b => out.push(b as char),
        }
    }
}

/// Oracle packed decimal. Byte 0 carries sign and exponent: `0x80` is
/// canonical zero, `>= 0xC0` positive with `byte0 - 0xC0` integer
/// base-100 pairs, `<= 0x3F` negative with `0x3F - byte0` pairs, value
/// bytes `101 - b` and a trailing `0x66` sentinel.
fn append_number(out: &mut String, data: &[u8]) {
    if data.is_empty() {
        warn!("unknown value (type: 2): empty");
        return;
    }

    let digits = data[0];
    if digits == 0x80 {
        out.push('0');
        return;
    }

    let mut j = 1usize;
    let j_max = data.len() - 1;

    if digits >= 0xC0 && j_max >= 1 {
        // positive
        if digits == 0xC0 {
            out.push('0');
        } else {
            let mut remaining = digits - 0xC0;
            // omit the leading zero of the first digit pair
            let val = data[j].wrapping_sub(1);
            if val < 10 {
                out.push((b'0' + val) as char);
            } else {
                out.push((b'0' + val / 10) as char);
                out.push((b'0' + val % 10) as char);
            }
            j += 1;
            remaining -= 1;

            while remaining > 0 {
                if j <= j_max {
                    let val = data[j].wrapping_sub(1);
                    out.push((b'0' + val / 10) as char);
                    out.push((b'0' + val % 10) as char);
                    j += 1;
                } else {
                    out.push_str("00");
                }
                remaining -= 1;
            }
        }

        if j <= j_max {
            out.push('.');
            while j < j_max {
                let val = data[j].wrapping_sub(1);
                out.push((b'0' + val / 10) as char);
                out.push((b'0' + val % 10) as char);
                j += 1;
            }
            // last fraction pair drops its trailing zero
            let val = data[j].wrapping_sub(1);
            out.push((b'0' + val / 10) as char);
            if val % 10 != 0 {
                out.push((b'0' + val % 10) as char);
            }
        }
    } else if digits <= 0x3F && data.len() >= 2 {
        // negative
        out.push('-');

        let mut j_max = j_max;
        if data[j_max] == 0x66 {
            j_max -= 1;
        }

        if digits == 0x3F {
            out.push('0');
        } else {
            let mut remaining = 0x3F - digits;
            let val = 101u8.wrapping_sub(data[j]);
            if val < 10 {
                out.push((b'0' + val) as char);
            } else {
                out.push((b'0' + val / 10) as char);
                out.push((b'0' + val % 10) as char);
            }
            j += 1;
            remaining -= 1;

            while remaining > 0 {
                if j <= j_max {
                    let val = 101u8.wrapping_sub(data[j]);
                    out.push((b'0' + val / 10) as char);
                    out.push((b'0' + val % 10) as char);
                    j += 1;
                } else {
                    out.push_str("00");
                }
                remaining -= 1;
            }
        }

        if j <= j_max {
            out.push('.');
            while j < j_max {
                let val = 101u8.wrapping_sub(data[j]);
                out.push((b'0' + val / 10) as char);
                out.push((b'0' + val % 10) as char);
                j += 1;
            }
            let val = 101u8.wrapping_sub(data[j]);
            out.push((b'0' + val / 10) as char);
            if val % 10 != 0 {
                out.push((b'0' + val % 10) as char);
            }
        }
    } else {
        warn!("unknown value (type: 2): {}", hex::encode(data));
    }
}

/// Oracle 7-byte date, rendered ISO-8601 `YYYY-MM-DDTHH:MM:SS`. Century
/// and year are biased by 100 for AD, `100 - b` for BC (rendered with a
/// `BC` suffix); time fields are stored one-based.
fn append_date(out: &mut String, type_no: u32, data: &[u8]) {
    if data.len() != 7 {
        warn!("unknown value (type: {}): {}", type_no, hex::encode(data));
        return;
    }

    let mut century = data[0] as i32;
    let mut year = data[1] as i32;
    let bc = if century >= 100 && year >= 100 {
        century -= 100;
        year -= 100;
        false
    } else {
        century = 100 - century;
        year = 100 - year;
        true
    };

    if century > 0 {
        if century >= 10 {
            out.push((b'0' + (century / 10) as u8) as char);
        }
        out.push((b'0' + (century % 10) as u8) as char);
        out.push((b'0' + (year / 10) as u8) as char);
        out.push((b'0' + (year % 10) as u8) as char);
    } else if year >= 10 {
        out.push((b'0' + (year / 10) as u8) as char);
        out.push((b'0' + (year % 10) as u8) as char);
    } else {
        out.push((b'0' + year as u8) as char);
    }

    if bc {
        out.push_str("BC");
    }

    out.push('-');
    out.push((b'0' + data[2] / 10) as char);
    out.push((b'0' + data[2] % 10) as char);
    out.push('-');
    out.push((b'0' + data[3] / 10) as char);
    out.push((b'0' + data[3] % 10) as char);
    out.push('T');
    let hour = data[4].wrapping_sub(1);
    let minute = data[5].wrapping_sub(1);
    let second = data[6].wrapping_sub(1);
    out.push((b'0' + hour / 10) as char);
    out.push((b'0' + hour % 10) as char);
    out.push(':');
    out.push((b'0' + minute / 10) as char);
    out.push((b'0' + minute % 10) as char);
    out.push(':');
    out.push((b'0' + second / 10) as char);
    out.push((b'0' + second % 10) as char);
}

#[cfg(test)]
mod value_tests {
    use std::env::set_var;

    use super::*;
    use crate::redo::craft::date_bytes;

    fn setup() {
        set_var("RUST_LOG", "info");
        crate::util::init();
    }

    fn fmt(type_no: u32, data: &[u8]) -> String {
        let mut out = String::new();
        append_value(&mut out, type_no, data);
        out
    }

    #[test]
    fn number_zero() {
        setup();
        assert_eq!(fmt(2, &[0x80]), "0");
    }

    #[test]
    fn number_positive_integers() {
        setup();
        // 1 = one pair "01"
        assert_eq!(fmt(2, &[0xC1, 0x02]), "1");
        // 10
        assert_eq!(fmt(2, &[0xC1, 0x0B]), "10");
        // 100 = pair "01", one implicit trailing pair
        assert_eq!(fmt(2, &[0xC2, 0x02]), "100");
        // 1234 = pairs 12, 34
        assert_eq!(fmt(2, &[0xC2, 0x0D, 0x23]), "1234");
    }

    #[test]
    fn number_positive_fractions() {
        setup();
        // 0.5 = no integer pairs, fraction pair 50
        assert_eq!(fmt(2, &[0xC0, 0x33]), "0.5");
        // 2.22
        assert_eq!(fmt(2, &[0xC1, 0x03, 0x17]), "2.22");
        // 1.1 - trailing zero of the last pair dropped
        assert_eq!(fmt(2, &[0xC1, 0x02, 0x0B]), "1.1");
    }

    #[test]
    fn number_negative() {
        setup();
        // -1 with the 0x66 terminator
        assert_eq!(fmt(2, &[0x3E, 0x64, 0x66]), "-1");
        // -1234
        assert_eq!(fmt(2, &[0x3D, 0x59, 0x43, 0x66]), "-1234");
        // -0.5
        assert_eq!(fmt(2, &[0x3F, 0x33, 0x66]), "-0.5");
    }

    #[test]
    fn number_garbage_is_skipped() {
        setup();
        // sign byte in neither range
        assert_eq!(fmt(2, &[0x7F, 0x01, 0x02]), "");
    }

    #[test]
    fn date_ad() {
        setup();
        assert_eq!(
            fmt(12, &date_bytes(2020, 1, 2, 3, 4, 5)),
            "2020-01-02T03:04:05"
        );
        assert_eq!(
            fmt(180, &date_bytes(1999, 12, 31, 23, 59, 59)),
            "1999-12-31T23:59:59"
        );
        // century with a 10xx year
        assert_eq!(
            fmt(12, &date_bytes(1050, 6, 15, 0, 0, 0)),
            "1050-06-15T00:00:00"
        );
        // single-digit year
        assert_eq!(fmt(12, &date_bytes(7, 3, 9, 1, 2, 3)), "7-03-09T01:02:03");
    }

    #[test]
    fn date_bc() {
        setup();
        // 100 - b encoding for BC years
        let raw = [100 - 3, 100 - 44, 2, 28, 1, 1, 1];
        assert_eq!(fmt(12, &raw), "344BC-02-28T00:00:00");
    }

    #[test]
    fn date_wrong_length_is_skipped() {
        setup();
        assert_eq!(fmt(12, &[1, 2, 3]), "");
    }

    #[test]
    fn varchar_escaping() {
        setup();
        assert_eq!(fmt(1, b"hi"), "hi");
        assert_eq!(fmt(96, b"a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn unknown_type_renders_question_mark() {
        setup();
        assert_eq!(fmt(113, &[1, 2, 3]), "?");
    }

    #[test]
    fn number_roundtrip_canonical_encodings() {
        setup();
        // (encoding, decimal string) pairs covering sign/int/fraction mixes
        let cases: &[(&[u8], &str)] = &[
            (&[0x80], "0"),
            (&[0xC1, 0x02], "1"),
            (&[0xC1, 0x64], "99"),
            (&[0xC2, 0x02, 0x03], "102"),
            (&[0xC0, 0x0B], "0.1"),
            (&[0xC1, 0x05, 0x1A], "4.25"),
            (&[0x3E, 0x64, 0x66], "-1"),
            (&[0x3F, 0x5B, 0x66], "-0.1"),
        ];
        for (enc, expect) in cases {
            let got = fmt(2, enc);
            assert_eq!(&got, expect, "encoding {:?}", hex::encode(enc));
            // the rendered string re-parses to the same logical value
            assert_eq!(got.parse::<f64>().unwrap(), expect.parse::<f64>().unwrap());
        }
    }
}
