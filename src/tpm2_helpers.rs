/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

use crate::tpm_buffer::TpmBuffer;

/// Convert a numeric enum value to its string representation
///
/// # Arguments
///
/// * `enum_val` - The numeric value of the enum
/// * `names` - The defined values of the enum type
/// * `is_flags` - Decompose unknown values into OR'd single-bit names
///
/// # Returns
///
/// The name of the value, a `|` separated list of flag names, or the hex value
pub fn enum_to_str(enum_val: u64, names: &[(u64, &str)], is_flags: bool) -> String {
    if let Some((_, name)) = names.iter().find(|(value, _)| *value == enum_val) {
        return name.to_string();
    }

    if !is_flags || enum_val == 0 {
        return format!("0x{:X}", enum_val);
    }

    let mut parts: Vec<String> = Vec::new();
    let mut unnamed: u64 = 0;

    for bit in (0..64).map(|i| 1u64 << i).filter(|bit| enum_val & bit != 0) {
        match names.iter().find(|(value, _)| *value == bit) {
            Some((_, name)) => parts.push(name.to_string()),
            None => unnamed |= bit,
        }
    }

    if unnamed != 0 {
        parts.push(format!("0x{:X}", unnamed));
    }
    parts.join(" | ")
}

/// Big-endian bytes of an integer, as it appears on the wire
pub fn int_to_tpm<T: Into<u64>>(val: T) -> Vec<u8> {
    let mut buffer = TpmBuffer::new(None);
    buffer.write_num(val.into(), std::mem::size_of::<T>());
    buffer.into_vec()
}

/// Strip trailing zero bytes from an authorization value
pub fn trim_trailing_zeros(value: &[u8]) -> &[u8] {
    let len = value.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
    &value[..len]
}
