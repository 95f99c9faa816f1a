//! Transparent zlib unwrapping of loaded files.

use flate2::{Decompress, FlushDecompress, Status};

/// Inflate output is pulled in blocks of this size.
pub const BLOCK_SIZE: usize = 131072;

/// Try to inflate `raw` as a zlib stream.
///
/// Returns the inflated bytes, or `raw` itself when the input is not a
/// complete zlib stream or inflates to nothing. Never fails.
pub fn unwrap(raw: Vec<u8>) -> Vec<u8> {
    match inflate(&raw) {
        Some(data) => {
            tracing::debug!("container: inflated {} -> {} bytes", raw.len(), data.len());
            data
        }
        None => raw,
    }
}

fn inflate(raw: &[u8]) -> Option<Vec<u8>> {
    let mut z = Decompress::new(true);
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let mut total = 0usize;

    loop {
        let mut block = vec![0u8; BLOCK_SIZE];
        let in_before = z.total_in() as usize;
        let out_before = z.total_out();
        let input = raw.get(in_before..)?;

        let status = z.decompress(input, &mut block, FlushDecompress::Sync).ok()?;
        let produced = (z.total_out() - out_before) as usize;
        let consumed = z.total_in() as usize - in_before;
        block.truncate(produced);
        total += produced;
        if produced > 0 {
            blocks.push(block);
        }

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // no progress on either side: stream is incomplete
                if produced == 0 && consumed == 0 {
                    return None;
                }
            }
        }
    }

    if total == 0 {
        return None;
    }
    let mut out = Vec::with_capacity(total);
    for block in blocks {
        out.extend_from_slice(&block);
    }
    Some(out)
}
