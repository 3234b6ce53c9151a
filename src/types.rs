//! Parameter encoding and result decoding.
//!
//! Values travel to the server through [`Encode`] and come back through
//! [`Decode`]. Builtin scalars use the PostgreSQL binary format (text for
//! strings); `Option<T>` is the NULL-capable variant of every builtin.
//! Custom codecs implement the same traits and share the connection's
//! append buffer.

use bytes::Bytes;
use chrono::NaiveDate;

use crate::error::{Error, Result};

/// Text wire format code.
pub const TEXT_FORMAT: i16 = 0;
/// Binary wire format code.
pub const BINARY_FORMAT: i16 = 1;

/// Well-known PostgreSQL type OIDs for the builtin codecs.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const DATE: u32 = 1082;
}

// ============================================================================
// Encoding
// ============================================================================

/// What an encoder produced: wire bytes appended to the shared buffer, or a
/// NULL marker with no bytes at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoded {
    Value { oid: u32, format: i16 },
    Null { format: i16 },
}

/// A value usable as a statement parameter.
///
/// Implementations append their wire representation to `buf` and report the
/// type OID and format, or return [`Encoded::Null`] without touching the
/// buffer. An OID of 0 lets the server infer the type.
pub trait Encode: Sync {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded;
}

impl<E: Encode + ?Sized> Encode for &E {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        (**self).encode(buf)
    }
}

/// A mutable location usable as a result destination.
///
/// `format` is the wire format the destination wants the server to send;
/// it is collected before the statement is issued. `decode` receives the
/// raw column value, `None` meaning SQL NULL.
pub trait Decode: Send {
    fn format(&self) -> i16;
    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()>;
}

impl<D: Decode + ?Sized> Decode for &mut D {
    fn format(&self) -> i16 {
        (**self).format()
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        (**self).decode(raw)
    }
}

fn check_len(ty: &'static str, expected: usize, buf: &[u8]) -> Result<()> {
    if buf.len() != expected {
        return Err(Error::SizeMismatch {
            ty,
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Strings
// ============================================================================

impl Encode for str {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        buf.extend_from_slice(self.as_bytes());
        Encoded::Value {
            oid: 0,
            format: TEXT_FORMAT,
        }
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    fn format(&self) -> i16 {
        TEXT_FORMAT
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        let buf = raw.ok_or(Error::NullConversion { ty: "String" })?;
        let s = std::str::from_utf8(buf).map_err(|e| Error::Decode {
            ty: "String",
            reason: e.to_string(),
        })?;
        self.clear();
        self.push_str(s);
        Ok(())
    }
}

impl Encode for Option<String> {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        match self {
            Some(v) => v.encode(buf),
            None => Encoded::Null {
                format: TEXT_FORMAT,
            },
        }
    }
}

impl Decode for Option<String> {
    fn format(&self) -> i16 {
        TEXT_FORMAT
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        match raw {
            None => {
                *self = None;
                Ok(())
            }
            Some(_) => {
                let mut value = String::new();
                value.decode(raw)?;
                *self = Some(value);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Fixed-width numerics
// ============================================================================

macro_rules! fixed_width_codec {
    ($ty:ty, $name:literal, $oid:expr, $width:expr) => {
        impl Encode for $ty {
            fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
                buf.extend_from_slice(&self.to_be_bytes());
                Encoded::Value {
                    oid: $oid,
                    format: BINARY_FORMAT,
                }
            }
        }

        impl Decode for $ty {
            fn format(&self) -> i16 {
                BINARY_FORMAT
            }

            fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
                let buf = raw.ok_or(Error::NullConversion { ty: $name })?;
                check_len($name, $width, buf)?;
                *self = <$ty>::from_be_bytes(buf.try_into().unwrap());
                Ok(())
            }
        }

        impl Encode for Option<$ty> {
            fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
                match self {
                    Some(v) => v.encode(buf),
                    None => Encoded::Null {
                        format: BINARY_FORMAT,
                    },
                }
            }
        }

        impl Decode for Option<$ty> {
            fn format(&self) -> i16 {
                BINARY_FORMAT
            }

            fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
                match raw {
                    None => {
                        *self = None;
                        Ok(())
                    }
                    Some(_) => {
                        let mut value = <$ty>::default();
                        value.decode(raw)?;
                        *self = Some(value);
                        Ok(())
                    }
                }
            }
        }
    };
}

fixed_width_codec!(i16, "i16", oid::INT2, 2);
fixed_width_codec!(i32, "i32", oid::INT4, 4);
fixed_width_codec!(i64, "i64", oid::INT8, 8);
fixed_width_codec!(f32, "f32", oid::FLOAT4, 4);
fixed_width_codec!(f64, "f64", oid::FLOAT8, 8);

// ============================================================================
// Booleans
// ============================================================================

impl Encode for bool {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        buf.push(*self as u8);
        Encoded::Value {
            oid: oid::BOOL,
            format: BINARY_FORMAT,
        }
    }
}

impl Decode for bool {
    fn format(&self) -> i16 {
        BINARY_FORMAT
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        let buf = raw.ok_or(Error::NullConversion { ty: "bool" })?;
        check_len("bool", 1, buf)?;
        *self = buf[0] == 1;
        Ok(())
    }
}

impl Encode for Option<bool> {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        match self {
            Some(v) => v.encode(buf),
            None => Encoded::Null {
                format: BINARY_FORMAT,
            },
        }
    }
}

impl Decode for Option<bool> {
    fn format(&self) -> i16 {
        BINARY_FORMAT
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        match raw {
            None => {
                *self = None;
                Ok(())
            }
            Some(_) => {
                let mut value = false;
                value.decode(raw)?;
                *self = Some(value);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Dates
// ============================================================================

/// Day offset the server uses for `-infinity`.
const NEG_INFINITY_DAY_OFFSET: i32 = i32::MIN;
/// Day offset the server uses for `infinity`.
const INFINITY_DAY_OFFSET: i32 = i32::MAX;

/// A calendar date, encoded as a signed 32-bit day offset from 2000-01-01.
///
/// `NegInfinity` and `Infinity` map to the server's `-infinity` and
/// `infinity` date values and order below and above every finite day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Date {
    NegInfinity,
    Day(NaiveDate),
    Infinity,
}

fn pg_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("2000-01-01 is a valid date")
}

impl Date {
    /// Builds a finite date; `None` when the year/month/day combination is
    /// not a real calendar day.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Date> {
        NaiveDate::from_ymd_opt(year, month, day).map(Date::Day)
    }

    fn day_offset(&self) -> i32 {
        match self {
            Date::NegInfinity => NEG_INFINITY_DAY_OFFSET,
            Date::Infinity => INFINITY_DAY_OFFSET,
            Date::Day(d) => (*d - pg_epoch()).num_days() as i32,
        }
    }

    fn from_day_offset(offset: i32) -> Result<Date> {
        match offset {
            INFINITY_DAY_OFFSET => Ok(Date::Infinity),
            NEG_INFINITY_DAY_OFFSET => Ok(Date::NegInfinity),
            _ => pg_epoch()
                .checked_add_signed(chrono::Duration::days(offset as i64))
                .map(Date::Day)
                .ok_or_else(|| Error::Decode {
                    ty: "Date",
                    reason: format!("day offset {} out of range", offset),
                }),
        }
    }
}

impl Default for Date {
    fn default() -> Self {
        Date::Day(pg_epoch())
    }
}

impl From<NaiveDate> for Date {
    fn from(d: NaiveDate) -> Self {
        Date::Day(d)
    }
}

impl Encode for Date {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        buf.extend_from_slice(&self.day_offset().to_be_bytes());
        Encoded::Value {
            oid: oid::DATE,
            format: BINARY_FORMAT,
        }
    }
}

impl Decode for Date {
    fn format(&self) -> i16 {
        BINARY_FORMAT
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        let buf = raw.ok_or(Error::NullConversion { ty: "Date" })?;
        check_len("Date", 4, buf)?;
        *self = Date::from_day_offset(i32::from_be_bytes(buf.try_into().unwrap()))?;
        Ok(())
    }
}

impl Encode for Option<Date> {
    fn encode(&self, buf: &mut Vec<u8>) -> Encoded {
        match self {
            Some(v) => v.encode(buf),
            None => Encoded::Null {
                format: BINARY_FORMAT,
            },
        }
    }
}

impl Decode for Option<Date> {
    fn format(&self) -> i16 {
        BINARY_FORMAT
    }

    fn decode(&mut self, raw: Option<&[u8]>) -> Result<()> {
        match raw {
            None => {
                *self = None;
                Ok(())
            }
            Some(_) => {
                let mut value = Date::default();
                value.decode(raw)?;
                *self = Some(value);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Skip sentinel
// ============================================================================

/// Destination that discards its column. Use it in a row tuple for result
/// columns the caller does not need.
#[derive(Debug, Default, Clone, Copy)]
pub struct Skip;

impl Decode for Skip {
    fn format(&self) -> i16 {
        // Any format works for a discarded column.
        TEXT_FORMAT
    }

    fn decode(&mut self, _raw: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Row destinations
// ============================================================================

/// A full set of result destinations for one statement.
///
/// Implemented for tuples of [`Decode`] destinations up to 16 columns. The
/// connection collects the requested formats before issuing the statement,
/// decodes every column of each row in place, and then hands the row to the
/// caller's callback by shared reference.
pub trait Row: Send {
    /// Appends the requested wire format of every column, left to right.
    fn formats(&self, out: &mut Vec<i16>);

    /// Decodes one wire row into the destinations.
    fn decode_row(&mut self, values: &[Option<Bytes>]) -> Result<()>;
}

impl Row for () {
    fn formats(&self, _out: &mut Vec<i16>) {}

    fn decode_row(&mut self, _values: &[Option<Bytes>]) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_row_for_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Decode),+> Row for ($($name,)+) {
            fn formats(&self, out: &mut Vec<i16>) {
                $( out.push(self.$idx.format()); )+
            }

            fn decode_row(&mut self, values: &[Option<Bytes>]) -> Result<()> {
                $( self.$idx.decode(values.get($idx).and_then(|v| v.as_deref()))?; )+
                Ok(())
            }
        }
    };
}

impl_row_for_tuple!(A: 0);
impl_row_for_tuple!(A: 0, B: 1);
impl_row_for_tuple!(A: 0, B: 1, C: 2);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13, O: 14);
impl_row_for_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11, M: 12, N: 13, O: 14, P: 15);

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_one(value: &dyn Encode) -> (Vec<u8>, Encoded) {
        let mut buf = Vec::new();
        let encoded = value.encode(&mut buf);
        (buf, encoded)
    }

    #[test]
    fn int4_encodes_big_endian() {
        let (buf, encoded) = encode_one(&305419896i32);
        assert_eq!(buf, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(
            encoded,
            Encoded::Value {
                oid: oid::INT4,
                format: BINARY_FORMAT
            }
        );
    }

    #[test]
    fn int2_roundtrip() {
        let (buf, _) = encode_one(&-123i16);
        let mut out = 0i16;
        out.decode(Some(&buf)).unwrap();
        assert_eq!(out, -123);
    }

    #[test]
    fn float8_roundtrip() {
        let (buf, _) = encode_one(&4.56f64);
        let mut out = 0f64;
        out.decode(Some(&buf)).unwrap();
        assert_eq!(out, 4.56);
    }

    #[test]
    fn bool_encoding() {
        let (buf, _) = encode_one(&true);
        assert_eq!(buf, vec![1]);
        let (buf, _) = encode_one(&false);
        assert_eq!(buf, vec![0]);

        let mut out = false;
        out.decode(Some(&[1])).unwrap();
        assert!(out);
    }

    #[test]
    fn string_encodes_raw_utf8() {
        let (buf, encoded) = encode_one(&"hello world");
        assert_eq!(buf, b"hello world");
        assert_eq!(
            encoded,
            Encoded::Value {
                oid: 0,
                format: TEXT_FORMAT
            }
        );
    }

    #[test]
    fn null_into_scalar_fails() {
        let mut out = 0i32;
        let err = out.decode(None).unwrap_err();
        assert_eq!(err.to_string(), "NULL cannot be converted to i32");
    }

    #[test]
    fn null_into_option_clears_it() {
        let mut out = Some(42i32);
        out.decode(None).unwrap();
        assert_eq!(out, None);

        out.decode(Some(&7i32.to_be_bytes())).unwrap();
        assert_eq!(out, Some(7));
    }

    #[test]
    fn none_encodes_as_null_marker() {
        let mut buf = Vec::new();
        let encoded = None::<i64>.encode(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(
            encoded,
            Encoded::Null {
                format: BINARY_FORMAT
            }
        );

        let encoded = None::<String>.encode(&mut buf);
        assert_eq!(
            encoded,
            Encoded::Null {
                format: TEXT_FORMAT
            }
        );
    }

    #[test]
    fn size_mismatch_is_reported() {
        let mut out = 0i16;
        let err = out.decode(Some(&[1, 2, 3])).unwrap_err();
        assert_eq!(err.to_string(), "i16 requires data length of 2, got 3");
    }

    #[test]
    fn date_day_offsets() {
        let date = Date::from_ymd(2000, 1, 1).unwrap();
        assert_eq!(date.day_offset(), 0);
        assert_eq!(Date::from_ymd(2000, 1, 2).unwrap().day_offset(), 1);
        assert_eq!(Date::from_ymd(1999, 12, 31).unwrap().day_offset(), -1);
        assert_eq!(Date::from_ymd(2020, 11, 9).unwrap().day_offset(), 7618);
    }

    #[test]
    fn date_roundtrip() {
        for date in [
            Date::from_ymd(1900, 1, 1).unwrap(),
            Date::from_ymd(1970, 1, 1).unwrap(),
            Date::from_ymd(2000, 1, 1).unwrap(),
            Date::from_ymd(2200, 1, 1).unwrap(),
            Date::NegInfinity,
            Date::Infinity,
        ] {
            let (buf, encoded) = encode_one(&date);
            assert_eq!(
                encoded,
                Encoded::Value {
                    oid: oid::DATE,
                    format: BINARY_FORMAT
                }
            );
            let mut out = Date::default();
            out.decode(Some(&buf)).unwrap();
            assert_eq!(out, date);
        }
    }

    #[test]
    fn date_sentinel_offsets() {
        let (buf, _) = encode_one(&Date::Infinity);
        assert_eq!(buf, i32::MAX.to_be_bytes());
        let (buf, _) = encode_one(&Date::NegInfinity);
        assert_eq!(buf, i32::MIN.to_be_bytes());
    }

    #[test]
    fn date_ordering() {
        let day = Date::from_ymd(2020, 11, 9).unwrap();
        assert!(Date::NegInfinity < day);
        assert!(day < Date::Infinity);
    }

    #[test]
    fn skip_accepts_anything() {
        let mut skip = Skip;
        skip.decode(None).unwrap();
        skip.decode(Some(&[1, 2, 3])).unwrap();
        assert_eq!(skip.format(), TEXT_FORMAT);
    }

    #[test]
    fn row_tuple_collects_formats() {
        let row = (String::new(), 0i32, Skip);
        let mut formats = Vec::new();
        row.formats(&mut formats);
        assert_eq!(formats, vec![TEXT_FORMAT, BINARY_FORMAT, TEXT_FORMAT]);
    }

    #[test]
    fn row_tuple_decodes_columns() {
        let mut row = (0i32, Skip, 0i32);
        let values = vec![
            Some(Bytes::copy_from_slice(&1i32.to_be_bytes())),
            Some(Bytes::from_static(b"ignored")),
            Some(Bytes::copy_from_slice(&3i32.to_be_bytes())),
        ];
        row.decode_row(&values).unwrap();
        assert_eq!(row.0, 1);
        assert_eq!(row.2, 3);
    }
}
