//! Total-order comparison on 16-bit packet sequence numbers under modular wrap-around.
//!
//! Sequence numbers wrap at 2^16, so `0` follows `65535`. Two sequence numbers are
//!  compared by treating the one less than half the number range ahead as the greater.
//!  Every ordering decision on sequence numbers in this crate goes through these
//!  functions; comparing them with the raw integer operators is wrong as soon as the
//!  sequence space wraps.

pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}
