//! Virtual block identity for parallel iteration fan-out.
//!
//! Grounded in the teacher's deterministic key derivation in
//! `vm.rs::tick_fiber` (`job_key = format!("{instance}:{task}:{pc}:{epoch}")`):
//! a virtual id is likewise a deterministic, parseable string, not an opaque
//! generated handle, so that `extract_original_id` can run without a lookup
//! table.

/// `<originalId>_parallel_<parallelId>_iteration_<N>`
pub fn generate(original_id: &str, parallel_id: &str, iteration_index: u32) -> String {
    format!("{original_id}_parallel_{parallel_id}_iteration_{iteration_index}")
}

pub fn is_virtual_id(id: &str) -> bool {
    parse(id).is_some()
}

/// Parsed components of a virtual id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualIdParts {
    pub original_id: String,
    pub parallel_id: String,
    pub iteration_index: u32,
}

/// Parses `^(.+)_parallel_(.+)_iteration_(\d+)$`, greedy on the first group
/// and non-greedy-by-construction on the second (we search for the *last*
/// `_iteration_<digits>` suffix first, then split the remainder on the last
/// `_parallel_`, so ids that legitimately contain the literal substrings
/// `_parallel_`/`_iteration_` in their original id still round-trip).
pub fn parse(id: &str) -> Option<VirtualIdParts> {
    const ITER_MARK: &str = "_iteration_";
    let iter_pos = id.rfind(ITER_MARK)?;
    let (head, iter_tail) = id.split_at(iter_pos);
    let iteration_digits = &iter_tail[ITER_MARK.len()..];
    if iteration_digits.is_empty() || !iteration_digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let iteration_index: u32 = iteration_digits.parse().ok()?;

    const PARALLEL_MARK: &str = "_parallel_";
    let parallel_pos = head.rfind(PARALLEL_MARK)?;
    let (original_id, parallel_tail) = head.split_at(parallel_pos);
    let parallel_id = &parallel_tail[PARALLEL_MARK.len()..];
    if original_id.is_empty() || parallel_id.is_empty() {
        return None;
    }

    Some(VirtualIdParts {
        original_id: original_id.to_string(),
        parallel_id: parallel_id.to_string(),
        iteration_index,
    })
}

/// The original block id behind a (possibly virtual) effective id.
pub fn extract_original_id(effective_id: &str) -> &str {
    match parse(effective_id) {
        Some(parts) => {
            // parts.original_id borrows from a temporary; recompute the slice
            // against the input instead of allocating.
            let len = parts.original_id.len();
            &effective_id[..len]
        }
        None => effective_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let id = generate("task_a", "par1", 3);
        assert_eq!(id, "task_a_parallel_par1_iteration_3");
        assert!(is_virtual_id(&id));
        assert_eq!(extract_original_id(&id), "task_a");
        let parts = parse(&id).unwrap();
        assert_eq!(parts.original_id, "task_a");
        assert_eq!(parts.parallel_id, "par1");
        assert_eq!(parts.iteration_index, 3);
    }

    #[test]
    fn plain_id_is_not_virtual() {
        assert!(!is_virtual_id("task_a"));
        assert_eq!(extract_original_id("task_a"), "task_a");
        assert!(parse("task_a").is_none());
    }

    #[test]
    fn rejects_non_numeric_iteration() {
        assert!(parse("task_a_parallel_p1_iteration_x").is_none());
    }

    #[test]
    fn handles_ids_containing_markers() {
        // original id itself contains "_parallel_" — should still parse via
        // rightmost split on the outer markers.
        let id = generate("a_parallel_inner", "p1", 0);
        let parts = parse(&id).unwrap();
        assert_eq!(parts.original_id, "a_parallel_inner");
        assert_eq!(parts.parallel_id, "p1");
    }
}
