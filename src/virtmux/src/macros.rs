// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Checked numerics for guest-supplied sizes and offsets.

/// `checked_range!(end <= limit)` is `Ok(())` when the bound holds.
#[macro_export]
macro_rules! checked_range {
    ($x:ident <= $y:ident) => {
        if $x <= $y {
            Ok(())
        } else {
            Err($crate::MuxError::CheckedRange {
                field1: (stringify!($x), $x as usize),
                field2: (stringify!($y), $y as usize),
            })
        }
    };
}

/// `checked_arithmetic!(a + b)` or `checked_arithmetic!(a * b)`, naming both operands on
/// overflow.
#[macro_export]
macro_rules! checked_arithmetic {
    ($x:ident $op:ident $y:ident $op_name:expr) => {
        $x.$op($y).ok_or_else(|| $crate::MuxError::CheckedArithmetic {
            field1: (stringify!($x), $x as usize),
            field2: (stringify!($y), $y as usize),
            op: $op_name,
        })
    };
    ($x:ident + $y:ident) => {
        checked_arithmetic!($x checked_add $y "+")
    };
    ($x:ident * $y:ident) => {
        checked_arithmetic!($x checked_mul $y "*")
    };
}

#[cfg(test)]
mod tests {
    use crate::MuxError;
    use crate::MuxResult;

    #[test]
    fn overflow_names_operands() {
        let stride = u32::MAX;
        let height = 2u32;
        match checked_arithmetic!(stride * height) {
            Err(MuxError::CheckedArithmetic { field1, field2, op }) => {
                assert_eq!(field1.0, "stride");
                assert_eq!(field2, ("height", 2));
                assert_eq!(op, "*");
            }
            other => panic!("unexpected {:?}", other),
        }
        let offset = 8u64;
        let len = 4u64;
        assert_eq!(checked_arithmetic!(offset + len).unwrap(), 12);
    }

    #[test]
    fn range_bound() {
        let end = 64usize;
        let available = 64usize;
        let ok: MuxResult<()> = checked_range!(end <= available);
        assert!(ok.is_ok());
        let available = 63usize;
        let err: MuxResult<()> = checked_range!(end <= available);
        assert!(matches!(err, Err(MuxError::CheckedRange { .. })));
    }
}
