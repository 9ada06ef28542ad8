//! Streaming Reed–Solomon (GF(2^8)) encode and reconstruct.
//!
//! The codec operates on arrays of readers and writers so that slices can be
//! memory buffers, whole files or sections of the original replica without
//! ever buffering the entire object. Work proceeds in fixed-size blocks: one
//! block is read from every present slice, the matrix math runs over the
//! block column, and the produced blocks are written out.
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::io::{Read, Write};

use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

/// Number of bytes processed from each slice per coding round.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Computes the parity slices of an object.
///
/// `readers` are the `data` equally sized data-slice readers (the tail slice
/// already zero padded); `writers` receive the `parity` parity slices. Every
/// reader must deliver exactly `slice_size` bytes.
pub fn encode<R, W>(
    data: usize,
    parity: usize,
    readers: &mut [R],
    writers: &mut [W],
    slice_size: u64,
) -> Result<()>
where
    R: Read,
    W: Write,
{
    track_assert_eq!(readers.len(), data, ErrorKind::Invalid);
    track_assert_eq!(writers.len(), parity, ErrorKind::Invalid);
    if slice_size == 0 {
        return Ok(());
    }
    let rs = track!(ReedSolomon::new(data, parity).map_err(Error::from))?;

    let mut remaining = slice_size;
    while remaining > 0 {
        let n = remaining.min(BLOCK_SIZE as u64) as usize;
        let mut shards = Vec::with_capacity(data + parity);
        for reader in readers.iter_mut() {
            let mut block = vec![0; n];
            track!(read_full(reader, &mut block))?;
            shards.push(block);
        }
        for _ in 0..parity {
            shards.push(vec![0; n]);
        }
        track!(rs.encode(&mut shards).map_err(Error::from))?;
        for (i, writer) in writers.iter_mut().enumerate() {
            track!(writer.write_all(&shards[data + i]).map_err(Error::from))?;
        }
        remaining -= n as u64;
    }
    for writer in writers.iter_mut() {
        track!(writer.flush().map_err(Error::from))?;
    }
    Ok(())
}

/// Rebuilds the missing slices of an object.
///
/// `readers` holds one entry per slice in slice order (`data` data slices
/// followed by `parity` parity slices); `None` marks a missing slice. Every
/// missing index must have a writer in `writers`; the reconstructed bytes are
/// streamed into it.
pub fn reconstruct<R, W>(
    data: usize,
    parity: usize,
    readers: &mut [Option<R>],
    writers: &mut [Option<W>],
    slice_size: u64,
) -> Result<()>
where
    R: Read,
    W: Write,
{
    let total = data + parity;
    track_assert_eq!(readers.len(), total, ErrorKind::Invalid);
    track_assert_eq!(writers.len(), total, ErrorKind::Invalid);

    let present = readers.iter().filter(|r| r.is_some()).count();
    if present < data {
        let cause = format!("{} slices survive, {} or more needed", present, data);
        return Err(track!(Error::from(ErrorKind::InsufficientSlices.cause(cause))));
    }
    for (i, reader) in readers.iter().enumerate() {
        track_assert!(
            reader.is_some() || writers[i].is_some(),
            ErrorKind::Invalid,
            "missing slice {} has no writer",
            i
        );
    }
    if slice_size == 0 {
        return Ok(());
    }
    let rs = track!(ReedSolomon::new(data, parity).map_err(Error::from))?;

    let mut remaining = slice_size;
    while remaining > 0 {
        let n = remaining.min(BLOCK_SIZE as u64) as usize;
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
        for reader in readers.iter_mut() {
            match reader {
                Some(reader) => {
                    let mut block = vec![0; n];
                    track!(read_full(reader, &mut block))?;
                    shards.push(Some(block));
                }
                None => shards.push(None),
            }
        }
        track!(rs.reconstruct(&mut shards).map_err(Error::from))?;
        for (i, writer) in writers.iter_mut().enumerate() {
            if readers[i].is_some() {
                continue;
            }
            if let Some(writer) = writer {
                let block = shards[i].as_ref().expect("never fails");
                track!(writer.write_all(block).map_err(Error::from))?;
            }
        }
        remaining -= n as u64;
    }
    for writer in writers.iter_mut().flatten() {
        track!(writer.flush().map_err(Error::from))?;
    }
    Ok(())
}

fn read_full<R: Read>(reader: &mut R, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = track!(reader.read(buf).map_err(Error::from))?;
        track_assert_ne!(n, 0, ErrorKind::Invalid, "slice shorter than expected");
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::slice_size;
    use std::io::Cursor;

    fn sections(payload: &[u8], data: u8) -> Vec<Vec<u8>> {
        let width = slice_size(payload.len() as u64, data) as usize;
        (0..usize::from(data))
            .map(|i| {
                let start = (i * width).min(payload.len());
                let end = ((i + 1) * width).min(payload.len());
                let mut section = payload[start..end].to_vec();
                section.resize(width, 0);
                section
            })
            .collect()
    }

    fn encode_all(payload: &[u8], data: u8, parity: u8) -> Vec<Vec<u8>> {
        let width = slice_size(payload.len() as u64, data);
        let mut slices = sections(payload, data);
        let mut readers = slices
            .iter()
            .map(|s| Cursor::new(s.clone()))
            .collect::<Vec<_>>();
        let mut writers = vec![Vec::new(); usize::from(parity)];
        encode(
            usize::from(data),
            usize::from(parity),
            &mut readers,
            &mut writers,
            width,
        )
        .unwrap();
        slices.extend(writers);
        slices
    }

    fn reconstruct_missing(
        slices: Vec<Option<Vec<u8>>>,
        data: u8,
        parity: u8,
        width: u64,
    ) -> Result<Vec<Vec<u8>>> {
        let mut readers = Vec::new();
        let mut writers: Vec<Option<Vec<u8>>> = Vec::new();
        for slot in &slices {
            match slot {
                Some(bytes) => {
                    readers.push(Some(Cursor::new(bytes.clone())));
                    writers.push(None);
                }
                None => {
                    readers.push(None);
                    writers.push(Some(Vec::new()));
                }
            }
        }
        track!(reconstruct(
            usize::from(data),
            usize::from(parity),
            &mut readers,
            &mut writers,
            width,
        ))?;
        Ok(slices
            .into_iter()
            .zip(writers)
            .map(|(original, rebuilt)| original.unwrap_or_else(|| rebuilt.expect("never fails")))
            .collect())
    }

    #[test]
    fn roundtrip_after_losing_parity_many_slices() {
        let payload = (0..200_001u32).map(|i| (i * 7) as u8).collect::<Vec<_>>();
        let (data, parity) = (4u8, 2u8);
        let width = slice_size(payload.len() as u64, data);
        let slices = encode_all(&payload, data, parity);

        // Drop any `parity` slices; reconstruction must produce identical bytes.
        for (a, b) in [(0, 5), (1, 2), (4, 5)] {
            let mut survivors: Vec<Option<Vec<u8>>> = slices.iter().cloned().map(Some).collect();
            survivors[a] = None;
            survivors[b] = None;
            let rebuilt = reconstruct_missing(survivors, data, parity, width).unwrap();
            assert_eq!(rebuilt, slices, "lost slices {} and {}", a, b);

            let mut out = Vec::new();
            for section in rebuilt.iter().take(usize::from(data)) {
                out.extend_from_slice(section);
            }
            out.truncate(payload.len());
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn too_few_slices_is_an_error() {
        let payload = vec![42u8; 10_000];
        let (data, parity) = (4u8, 2u8);
        let width = slice_size(payload.len() as u64, data);
        let slices = encode_all(&payload, data, parity);

        let mut survivors: Vec<Option<Vec<u8>>> = slices.into_iter().map(Some).collect();
        survivors[0] = None;
        survivors[1] = None;
        survivors[2] = None;
        let e = reconstruct_missing(survivors, data, parity, width)
            .err()
            .expect("must fail");
        assert_eq!(*e.kind(), ErrorKind::InsufficientSlices);
    }

    #[test]
    fn exactly_data_slices_suffice() {
        let payload = (0..65_536u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let (data, parity) = (3u8, 3u8);
        let width = slice_size(payload.len() as u64, data);
        let slices = encode_all(&payload, data, parity);

        let mut survivors: Vec<Option<Vec<u8>>> = slices.iter().cloned().map(Some).collect();
        survivors[0] = None;
        survivors[2] = None;
        survivors[4] = None;
        let rebuilt = reconstruct_missing(survivors, data, parity, width).unwrap();
        assert_eq!(rebuilt, slices);
    }

    #[test]
    fn zero_sized_object_is_a_noop() {
        let mut readers = vec![Cursor::new(Vec::new()), Cursor::new(Vec::new())];
        let mut writers = vec![Vec::new()];
        encode(2, 1, &mut readers, &mut writers, 0).unwrap();
        assert!(writers[0].is_empty());
    }
}
