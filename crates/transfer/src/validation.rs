use crate::TransferError;
use crate::types::ChunkInfo;

/// Validates that `plan` covers `[0, file_size)` with contiguous,
/// non-overlapping, 0-based chunks, and that each chunk carries an etag
/// exactly when it is marked uploaded.
///
/// Rejects:
/// - Indices that are not `0, 1, 2, ...` in order
/// - Empty ranges, gaps and overlaps
/// - A plan that stops short of or runs past `file_size`
/// - `uploaded` without an etag, or an etag without `uploaded`
pub fn validate_plan(plan: &[ChunkInfo], file_size: u64) -> Result<(), TransferError> {
    let mut expected_start = 0u64;

    for (position, chunk) in plan.iter().enumerate() {
        if chunk.index as usize != position {
            return Err(TransferError::InvalidPlan(format!(
                "chunk at position {position} has index {}",
                chunk.index
            )));
        }
        if chunk.byte_range.start != expected_start {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {} starts at {} but previous chunk ended at {expected_start}",
                chunk.index, chunk.byte_range.start
            )));
        }
        if chunk.byte_range.is_empty() {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {} has an empty range",
                chunk.index
            )));
        }
        if chunk.uploaded != chunk.etag.is_some() {
            return Err(TransferError::InvalidPlan(format!(
                "chunk {} uploaded={} but etag present={}",
                chunk.index,
                chunk.uploaded,
                chunk.etag.is_some()
            )));
        }
        expected_start = chunk.byte_range.end;
    }

    if expected_start != file_size {
        return Err(TransferError::InvalidPlan(format!(
            "plan covers {expected_start} bytes of {file_size}"
        )));
    }

    Ok(())
}
