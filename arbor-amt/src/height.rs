//! Height arithmetic: subtree capacities and key splitting.

/// Number of logical slots addressable by a subtree rooted at `height`,
/// i.e. `W^height` for branching factor `W = 2^bit_width`.
///
/// Saturates to `u64::MAX` once the shift reaches 64 bits; the load-time
/// sanity checks rely on this saturation to reject implausible heights.
pub(crate) fn nodes_for_height(bit_width: u32, height: u32) -> u64 {
    let shift = u64::from(bit_width) * u64::from(height);
    if shift >= 64 {
        u64::MAX
    } else {
        1 << shift
    }
}
