/// One sample per active channel, delivered once per acquisition tick.
pub type Frame = Vec<i32>;

/// Mask samples to their low byte when the device runs at 8 bits.
///
/// The transport sign-extends 8-bit samples, so raw values can arrive negative
/// or with garbage in the upper bits. Other widths pass through untouched.
pub fn normalize_bit_width(samples: &mut [i32], number_of_bits: u8) {
    if number_of_bits == 8 {
        for value in samples.iter_mut() {
            *value &= 0xff;
        }
    }
}
