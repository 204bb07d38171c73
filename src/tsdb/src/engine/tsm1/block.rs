//! Block encoding.
//!
//! A block is one type byte, a big-endian u32 point count, the block's
//! timestamps, then the typed payload. The layout is deliberately plain;
//! the `encode_block`/`decode_block` seam is where a compressed codec
//! would slot in.

use bytes::BufMut;

use crate::engine::tsm1::value::{TimeValue, Values};

/// BLOCK_FLOAT64 designates a block encodes float64 values.
pub const BLOCK_FLOAT64: u8 = 0;

/// BLOCK_INTEGER designates a block encodes int64 values.
pub const BLOCK_INTEGER: u8 = 1;

/// BLOCK_BOOLEAN designates a block encodes boolean values.
pub const BLOCK_BOOLEAN: u8 = 2;

/// BLOCK_STRING designates a block encodes string values.
pub const BLOCK_STRING: u8 = 3;

/// BLOCK_UNSIGNED designates a block encodes uint64 values.
pub const BLOCK_UNSIGNED: u8 = 4;

/// block_type returns the type byte of an encoded block.
pub fn block_type(block: &[u8]) -> anyhow::Result<u8> {
    if block.is_empty() {
        return Err(anyhow!("block_type: no data found"));
    }
    let typ = block[0];
    if typ > BLOCK_UNSIGNED {
        return Err(anyhow!("unknown block type: {}", typ));
    }
    Ok(typ)
}

/// encode_block appends the encoded form of `values` to `dst`.
pub fn encode_block(dst: &mut Vec<u8>, values: &Values) -> anyhow::Result<()> {
    if values.is_empty() {
        return Err(anyhow!("encode_block: no data found"));
    }

    dst.push(values.block_type());
    dst.put_u32(values.len() as u32);

    match values {
        Values::Float(v) => {
            for x in v {
                dst.put_i64(x.unix_nano);
            }
            for x in v {
                dst.put_f64(x.value);
            }
        }
        Values::Integer(v) => {
            for x in v {
                dst.put_i64(x.unix_nano);
            }
            for x in v {
                dst.put_i64(x.value);
            }
        }
        Values::Bool(v) => {
            for x in v {
                dst.put_i64(x.unix_nano);
            }
            for x in v {
                dst.put_u8(x.value as u8);
            }
        }
        Values::String(v) => {
            for x in v {
                dst.put_i64(x.unix_nano);
            }
            for x in v {
                dst.put_u32(x.value.len() as u32);
                dst.extend_from_slice(&x.value);
            }
        }
        Values::Unsigned(v) => {
            for x in v {
                dst.put_i64(x.unix_nano);
            }
            for x in v {
                dst.put_u64(x.value);
            }
        }
    }

    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(anyhow!("decode_block: short buffer"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    fn get_f64(&mut self) -> anyhow::Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }
}

/// decode_block decodes an encoded block back into typed values.
pub fn decode_block(block: &[u8]) -> anyhow::Result<Values> {
    let mut cur = Cursor { buf: block, pos: 0 };
    let typ = cur.get_u8()?;
    if typ > BLOCK_UNSIGNED {
        return Err(anyhow!("unknown block type: {}", typ));
    }

    let count = cur.get_u32()? as usize;
    let mut timestamps = Vec::with_capacity(count);
    for _ in 0..count {
        timestamps.push(cur.get_i64()?);
    }

    let values = match typ {
        BLOCK_FLOAT64 => {
            let mut v = Vec::with_capacity(count);
            for ts in timestamps {
                v.push(TimeValue::new(ts, cur.get_f64()?));
            }
            Values::Float(v)
        }
        BLOCK_INTEGER => {
            let mut v = Vec::with_capacity(count);
            for ts in timestamps {
                v.push(TimeValue::new(ts, cur.get_i64()?));
            }
            Values::Integer(v)
        }
        BLOCK_BOOLEAN => {
            let mut v = Vec::with_capacity(count);
            for ts in timestamps {
                v.push(TimeValue::new(ts, cur.get_u8()? != 0));
            }
            Values::Bool(v)
        }
        BLOCK_STRING => {
            let mut v = Vec::with_capacity(count);
            for ts in timestamps {
                let len = cur.get_u32()? as usize;
                v.push(TimeValue::new(ts, cur.take(len)?.to_vec()));
            }
            Values::String(v)
        }
        BLOCK_UNSIGNED => {
            let mut v = Vec::with_capacity(count);
            for ts in timestamps {
                v.push(TimeValue::new(ts, cur.get_u64()?));
            }
            Values::Unsigned(v)
        }
        _ => unreachable!(),
    };

    if cur.pos != block.len() {
        return Err(anyhow!(
            "decode_block: {} trailing bytes",
            block.len() - cur.pos
        ));
    }
    Ok(values)
}
