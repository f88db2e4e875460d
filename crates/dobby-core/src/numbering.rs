//! Conversion between total numbers and (number within repeat, repeat number).
//!
//! A total number counts picks or ends across repeats:
//! `total = repeat_len * (repeat_number - 1) + num_within`.

use crate::error::RepeatLengthError;

/// Largest total pick or end number a client may jump to.
pub const MAX_TOTAL_NUMBER: i64 = i32::MAX as i64;

/// Compute the total number from a number within a repeat and its repeat number.
///
/// Saturates at the `i64` bounds.
pub fn compute_total_num(
    num_within: i64,
    repeat_number: i64,
    repeat_len: i64,
) -> Result<i64, RepeatLengthError> {
    if repeat_len <= 0 {
        return Err(RepeatLengthError(repeat_len));
    }
    Ok(repeat_len
        .saturating_mul(repeat_number.saturating_sub(1))
        .saturating_add(num_within))
}

/// Split a total number into `(num_within, repeat_number)`.
///
/// Exact nonzero multiples of the repeat length land on the last item of
/// the previous repeat (`num_within == repeat_len`) rather than on item 0
/// of the next one; a total of 0 is `(0, 1)`.
pub fn compute_num_within_and_repeats(
    total: i64,
    repeat_len: i64,
) -> Result<(i64, i64), RepeatLengthError> {
    if repeat_len <= 0 {
        return Err(RepeatLengthError(repeat_len));
    }
    let mut repeat0 = total.div_euclid(repeat_len);
    let mut num_within = total.rem_euclid(repeat_len);
    if num_within == 0 && total != 0 {
        num_within = repeat_len;
        repeat0 -= 1;
    }
    Ok((num_within, repeat0 + 1))
}
