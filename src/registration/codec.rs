//! Binary codec for registration records.
//!
//! The layout is length-free and order-sensitive: a `u32` binding count,
//! then per binding the nul-terminated identifier, contact URI and Call-ID,
//! the fixed `u32` fields (CSeq, expiry, priority), the counted parameter
//! pairs and the counted Path headers. Integers are little-endian
//! explicitly, so records written on one host decode on any other.

use super::AoR;
use crate::error::{Error, Result};

pub(super) fn serialize_aor(aor: &AoR) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    put_u32(&mut out, aor.binding_count() as u32);

    for (binding_id, binding) in aor.bindings() {
        put_str(&mut out, binding_id)?;
        put_str(&mut out, &binding.uri)?;
        put_str(&mut out, &binding.call_id)?;
        put_u32(&mut out, binding.cseq);
        put_u32(&mut out, binding.expires);
        put_u32(&mut out, binding.priority);

        put_u32(&mut out, binding.params.len() as u32);
        for (name, value) in &binding.params {
            put_str(&mut out, name)?;
            put_str(&mut out, value)?;
        }

        put_u32(&mut out, binding.path_headers.len() as u32);
        for path in &binding.path_headers {
            put_str(&mut out, path)?;
        }
    }

    Ok(out)
}

pub(super) fn deserialize_aor(data: &[u8]) -> Result<AoR> {
    let mut reader = Reader::new(data);
    let mut aor = AoR::new();

    let num_bindings = reader.read_u32()?;
    for _ in 0..num_bindings {
        let binding_id = reader.read_str()?;
        let uri = reader.read_str()?;
        let call_id = reader.read_str()?;
        let cseq = reader.read_u32()?;
        let expires = reader.read_u32()?;
        let priority = reader.read_u32()?;

        let num_params = reader.read_u32()?;
        let mut params = Vec::new();
        for _ in 0..num_params {
            let name = reader.read_str()?;
            let value = reader.read_str()?;
            params.push((name, value));
        }

        let num_paths = reader.read_u32()?;
        let mut path_headers = Vec::new();
        for _ in 0..num_paths {
            path_headers.push(reader.read_str()?);
        }

        let binding = aor.get_binding(&binding_id);
        binding.uri = uri;
        binding.call_id = call_id;
        binding.cseq = cseq;
        binding.expires = expires;
        binding.priority = priority;
        binding.params = params;
        binding.path_headers = path_headers;
    }

    reader.finish()?;
    Ok(aor)
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(Error::codec("string field contains a NUL byte"));
    }
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::codec("short read on integer field"))?;
        self.pos = end;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_str(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::codec("missing string terminator"))?;
        let value = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::codec("string field is not valid utf-8"))?
            .to_string();
        self.pos += nul + 1;
        Ok(value)
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(Error::codec("trailing bytes after last binding"));
        }
        Ok(())
    }
}
