#![forbid(unsafe_code)]

//! Integer helpers for page and chunk geometry.

/// Computes `ceil(x / y)`. `y` must be non-zero.
pub fn ceil_div(x: u64, y: u64) -> u64 {
    debug_assert!(y > 0, "ceil_div by zero");
    x / y + u64::from(x % y != 0)
}

/// Rounds `x` up to the next multiple of `align`.
pub fn round_up(x: u64, align: u64) -> u64 {
    ceil_div(x, align) * align
}

/// Rounds `x` down to the previous multiple of `align`.
pub fn round_down(x: u64, align: u64) -> u64 {
    (x / align) * align
}

/// Greatest common divisor (Euclid).
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
