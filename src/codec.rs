//! Cursor-based reader/writer for GATT attribute payloads.
//!
//! Health-profile characteristics pack fields back to back: fixed-width
//! integers, IEEE-11073 medical floats, Latin-1 strings and 7-byte
//! date-times. [`AttributeCodec`] walks such a payload with an internal
//! cursor; every `read_*` consumes its field and every `*_at` variant peeks
//! at an absolute offset without moving the cursor. Writes grow the buffer
//! zero-filled so fields can be placed at arbitrary offsets.

use std::fmt;

use thiserror::Error;

/// Byte order applied to multi-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Wire format codes for integer and float fields. The low nibble of the
/// code is the field width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatType {
    UInt8,
    UInt16,
    UInt32,
    SInt8,
    SInt16,
    SInt32,
    SFloat,
    Float,
}

impl FormatType {
    pub fn code(self) -> u8 {
        match self {
            FormatType::UInt8 => 0x11,
            FormatType::UInt16 => 0x12,
            FormatType::UInt32 => 0x14,
            FormatType::SInt8 => 0x21,
            FormatType::SInt16 => 0x22,
            FormatType::SInt32 => 0x24,
            FormatType::SFloat => 0x32,
            FormatType::Float => 0x34,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0x11 => Ok(FormatType::UInt8),
            0x12 => Ok(FormatType::UInt16),
            0x14 => Ok(FormatType::UInt32),
            0x21 => Ok(FormatType::SInt8),
            0x22 => Ok(FormatType::SInt16),
            0x24 => Ok(FormatType::SInt32),
            0x32 => Ok(FormatType::SFloat),
            0x34 => Ok(FormatType::Float),
            other => Err(CodecError::UnsupportedFormat(other)),
        }
    }

    /// Field width in bytes.
    pub fn byte_width(self) -> usize {
        (self.code() & 0x0F) as usize
    }

    fn is_signed(self) -> bool {
        self.code() & 0xF0 == 0x20
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("offset {offset} with {needed} byte(s) needed exceeds value length {available}")]
    InvalidOffset {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported format code {0:#04x}")]
    UnsupportedFormat(u8),

    #[error("invalid hex string")]
    InvalidHex,
}

/// Calendar timestamp as packed into the 7-byte GATT date-time field.
///
/// The year is always little-endian on the wire regardless of the codec's
/// configured byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hours, self.minutes, self.seconds
        )
    }
}

/// Cursor-based attribute payload codec.
#[derive(Debug, Clone)]
pub struct AttributeCodec {
    value: Vec<u8>,
    offset: usize,
    byte_order: ByteOrder,
}

impl Default for AttributeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeCodec {
    /// Empty little-endian codec for composing a payload.
    pub fn new() -> Self {
        Self::with_order(Vec::new(), ByteOrder::LittleEndian)
    }

    /// Wrap a received payload, little-endian.
    pub fn from_bytes(value: Vec<u8>) -> Self {
        Self::with_order(value, ByteOrder::LittleEndian)
    }

    pub fn with_order(value: Vec<u8>, byte_order: ByteOrder) -> Self {
        Self {
            value,
            offset: 0,
            byte_order,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.value
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reposition the cursor. Positions up to and including the end of the
    /// value are valid.
    pub fn set_offset(&mut self, offset: usize) -> Result<(), CodecError> {
        if offset > self.value.len() {
            return Err(CodecError::InvalidOffset {
                offset,
                needed: 0,
                available: self.value.len(),
            });
        }
        self.offset = offset;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.value.len() - self.offset
    }

    fn check(&self, offset: usize, needed: usize) -> Result<(), CodecError> {
        if offset + needed > self.value.len() {
            return Err(CodecError::InvalidOffset {
                offset,
                needed,
                available: self.value.len(),
            });
        }
        Ok(())
    }

    /// Raw unsigned integer of `width` bytes at `offset` in the configured
    /// byte order.
    fn raw_at(&self, offset: usize, width: usize) -> Result<u64, CodecError> {
        self.check(offset, width)?;
        let bytes = &self.value[offset..offset + width];
        let mut out: u64 = 0;
        match self.byte_order {
            ByteOrder::LittleEndian => {
                for (i, b) in bytes.iter().enumerate() {
                    out |= (*b as u64) << (8 * i);
                }
            }
            ByteOrder::BigEndian => {
                for b in bytes {
                    out = (out << 8) | *b as u64;
                }
            }
        }
        Ok(out)
    }

    fn put_raw(&mut self, offset: usize, width: usize, raw: u64) {
        if self.value.len() < offset + width {
            self.value.resize(offset + width, 0);
        }
        for i in 0..width {
            let byte = match self.byte_order {
                ByteOrder::LittleEndian => (raw >> (8 * i)) as u8,
                ByteOrder::BigEndian => (raw >> (8 * (width - 1 - i))) as u8,
            };
            self.value[offset + i] = byte;
        }
    }

    // ---- integer reads ----

    /// Integer field described by a wire format code, sign-extended for the
    /// signed formats. Does not move the cursor.
    pub fn int_at(&self, format: FormatType, offset: usize) -> Result<i64, CodecError> {
        let width = format.byte_width();
        match format {
            FormatType::SFloat | FormatType::Float => {
                return Err(CodecError::UnsupportedFormat(format.code()))
            }
            _ => {}
        }
        let raw = self.raw_at(offset, width)?;
        if format.is_signed() {
            Ok(sign_extend(raw, width * 8))
        } else {
            Ok(raw as i64)
        }
    }

    /// Integer field at the cursor; advances by the field width.
    pub fn read_int(&mut self, format: FormatType) -> Result<i64, CodecError> {
        let v = self.int_at(format, self.offset)?;
        self.offset += format.byte_width();
        Ok(v)
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8, CodecError> {
        Ok(self.raw_at(offset, 1)? as u8)
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16, CodecError> {
        Ok(self.raw_at(offset, 2)? as u16)
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32, CodecError> {
        Ok(self.raw_at(offset, 4)? as u32)
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64, CodecError> {
        self.raw_at(offset, 8)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let v = self.u8_at(self.offset)?;
        self.offset += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let v = self.u16_at(self.offset)?;
        self.offset += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let v = self.u32_at(self.offset)?;
        self.offset += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let v = self.u64_at(self.offset)?;
        self.offset += 8;
        Ok(v)
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.read_int(FormatType::SInt8)? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.read_int(FormatType::SInt16)? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_int(FormatType::SInt32)? as i32)
    }

    // ---- float reads ----

    /// 16-bit medical float: 12-bit two's-complement mantissa, 4-bit
    /// exponent, value = mantissa * 10^exponent.
    pub fn sfloat_at(&self, offset: usize) -> Result<f32, CodecError> {
        let raw = self.raw_at(offset, 2)? as u16;
        let mantissa = sign_extend((raw & 0x0FFF) as u64, 12) as f64;
        let exponent = sign_extend((raw >> 12) as u64, 4) as i32;
        Ok((mantissa * 10f64.powi(exponent)) as f32)
    }

    pub fn read_sfloat(&mut self) -> Result<f32, CodecError> {
        let v = self.sfloat_at(self.offset)?;
        self.offset += 2;
        Ok(v)
    }

    /// 32-bit medical float: 24-bit two's-complement mantissa, 8-bit
    /// exponent.
    pub fn float_at(&self, offset: usize) -> Result<f32, CodecError> {
        let raw = self.raw_at(offset, 4)? as u32;
        let mantissa = sign_extend((raw & 0x00FF_FFFF) as u64, 24) as f64;
        let exponent = (raw >> 24) as u8 as i8 as i32;
        Ok((mantissa * 10f64.powi(exponent)) as f32)
    }

    pub fn read_float(&mut self) -> Result<f32, CodecError> {
        let v = self.float_at(self.offset)?;
        self.offset += 4;
        Ok(v)
    }

    // ---- strings, bytes, date-time ----

    /// Latin-1 string from `offset` to the end of the value, with trailing
    /// NUL and space padding removed. Does not move the cursor.
    pub fn string_at(&self, offset: usize) -> Result<String, CodecError> {
        self.check(offset, 0)?;
        let s: String = self.value[offset..].iter().map(|&b| b as char).collect();
        Ok(s.trim_end_matches(['\0', ' ']).to_string())
    }

    /// Latin-1 string covering the rest of the value; cursor moves to the
    /// end.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let s = self.string_at(self.offset)?;
        self.offset = self.value.len();
        Ok(s)
    }

    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&[u8], CodecError> {
        self.check(offset, len)?;
        Ok(&self.value[offset..offset + len])
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        let out = self.bytes_at(self.offset, len)?.to_vec();
        self.offset += len;
        Ok(out)
    }

    /// 7-byte date-time field. The year is little-endian on the wire
    /// regardless of the configured byte order.
    pub fn date_time_at(&self, offset: usize) -> Result<DateTime, CodecError> {
        self.check(offset, 7)?;
        let b = &self.value[offset..offset + 7];
        Ok(DateTime {
            year: b[0] as u16 | (b[1] as u16) << 8,
            month: b[2],
            day: b[3],
            hours: b[4],
            minutes: b[5],
            seconds: b[6],
        })
    }

    pub fn read_date_time(&mut self) -> Result<DateTime, CodecError> {
        let v = self.date_time_at(self.offset)?;
        self.offset += 7;
        Ok(v)
    }

    // ---- writes (grow zero-filled, advance the cursor) ----

    pub fn write_int(&mut self, value: i64, format: FormatType) -> Result<(), CodecError> {
        match format {
            FormatType::SFloat | FormatType::Float => {
                return Err(CodecError::UnsupportedFormat(format.code()))
            }
            _ => {}
        }
        let width = format.byte_width();
        self.put_raw(self.offset, width, value as u64);
        self.offset += width;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) {
        self.put_raw(self.offset, 1, value as u64);
        self.offset += 1;
    }

    pub fn write_u16(&mut self, value: u16) {
        self.put_raw(self.offset, 2, value as u64);
        self.offset += 2;
    }

    pub fn write_u32(&mut self, value: u32) {
        self.put_raw(self.offset, 4, value as u64);
        self.offset += 4;
    }

    pub fn write_u64(&mut self, value: u64) {
        self.put_raw(self.offset, 8, value);
        self.offset += 8;
    }

    /// 16-bit medical float from an explicit mantissa and exponent. The
    /// mantissa is truncated to 12 bits, the exponent to 4.
    pub fn write_sfloat(&mut self, mantissa: i32, exponent: i32) {
        let raw = ((mantissa as u16) & 0x0FFF) | ((exponent as u16) & 0x000F) << 12;
        self.put_raw(self.offset, 2, raw as u64);
        self.offset += 2;
    }

    /// 32-bit medical float from an explicit mantissa and exponent.
    pub fn write_float(&mut self, mantissa: i32, exponent: i32) {
        let raw = ((mantissa as u32) & 0x00FF_FFFF) | ((exponent as u32) & 0xFF) << 24;
        self.put_raw(self.offset, 4, raw as u64);
        self.offset += 4;
    }

    /// Encode `value` as a 32-bit medical float keeping `precision` decimal
    /// places: mantissa = round(value * 10^precision), exponent =
    /// -precision.
    pub fn set_float(&mut self, value: f32, precision: i32) {
        let mantissa = (value as f64 * 10f64.powi(precision)).round() as i32;
        self.write_float(mantissa, -precision);
    }

    /// Latin-1 string; characters outside Latin-1 are replaced with `?`.
    pub fn write_string(&mut self, value: &str) {
        let bytes: Vec<u8> = value
            .chars()
            .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
            .collect();
        self.write_bytes(&bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.value.len() < self.offset + bytes.len() {
            self.value.resize(self.offset + bytes.len(), 0);
        }
        self.value[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    /// 7-byte date-time field.
    pub fn write_date_time(&mut self, dt: &DateTime) {
        let bytes = [
            (dt.year & 0xFF) as u8,
            (dt.year >> 8) as u8,
            dt.month,
            dt.day,
            dt.hours,
            dt.minutes,
            dt.seconds,
        ];
        self.write_bytes(&bytes);
    }

    /// 10-byte Current Time field: date-time, day of week (1 = Monday),
    /// 1/256 second fraction, adjust reason 0.
    pub fn write_current_time(&mut self, dt: &DateTime, day_of_week: u8, fractions256: u8) {
        self.write_date_time(dt);
        self.write_bytes(&[day_of_week, fractions256, 0]);
    }
}

fn sign_extend(raw: u64, bits: usize) -> i64 {
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Render bytes as contiguous lowercase hex, for log lines.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Parse contiguous hex into bytes. Odd-length or non-hex input is
/// rejected.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, CodecError> {
    // Indexing below is byte-wise; non-ASCII would split a char.
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(CodecError::InvalidHex);
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| CodecError::InvalidHex))
        .collect()
}

/// Concatenate several byte slices into one payload.
pub fn merge_arrays(arrays: &[&[u8]]) -> Vec<u8> {
    let total = arrays.iter().map(|a| a.len()).sum();
    let mut out = Vec::with_capacity(total);
    for a in arrays {
        out.extend_from_slice(a);
    }
    out
}
