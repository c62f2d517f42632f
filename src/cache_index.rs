use crate::models::{Series, TimeRange};
use log::info;

/// Chunks that still need fetching.
///
/// A chunk counts as cached only when the rows at both its start and its end
/// open time are present in `cached`. Rows between the two endpoints are not
/// checked. A missing row simply marks the chunk uncached.
pub fn uncached(desired: &[TimeRange], cached: &Series) -> Vec<TimeRange> {
    if cached.is_empty() {
        return desired.to_vec();
    }

    let needed: Vec<TimeRange> = desired
        .iter()
        .filter(|chunk| !is_cached(chunk, cached))
        .copied()
        .collect();

    info!(
        "Found {} chunks already cached",
        desired.len() - needed.len()
    );
    needed
}

fn is_cached(chunk: &TimeRange, cached: &Series) -> bool {
    cached.contains(chunk.start_ms) && cached.contains(chunk.end_ms)
}
