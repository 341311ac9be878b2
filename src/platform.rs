//! Startup sanity checks on the host platform.
//!
//! Run before any daemon state exists; a failure is fatal.

/// Pointer widths the daemon's machine-word call parameters are sized for.
const SUPPORTED_POINTER_WIDTHS: [usize; 2] = [32, 64];

/// Verify the running host matches what the binary was compiled for.
pub fn check() -> Result<(), PlatformError> {
    check_endianness(host_is_big_endian())?;
    check_pointer_width(usize::BITS as usize)?;
    Ok(())
}

fn host_is_big_endian() -> bool {
    1u32.to_ne_bytes()[0] == 0
}

fn check_endianness(host_big_endian: bool) -> Result<(), PlatformError> {
    let compiled_big_endian = cfg!(target_endian = "big");
    if host_big_endian != compiled_big_endian {
        return Err(PlatformError::Endianness {
            compiled_big_endian,
        });
    }
    Ok(())
}

fn check_pointer_width(bits: usize) -> Result<(), PlatformError> {
    if !SUPPORTED_POINTER_WIDTHS.contains(&bits) {
        return Err(PlatformError::PointerWidth { bits });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    Endianness { compiled_big_endian: bool },
    PointerWidth { bits: usize },
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformError::Endianness {
                compiled_big_endian,
            } => {
                let compiled = if *compiled_big_endian { "big" } else { "little" };
                write!(f, "endianness mismatch: built for {compiled}-endian")
            }
            PlatformError::PointerWidth { bits } => {
                write!(f, "unusable pointer width {bits}, must be 32 or 64")
            }
        }
    }
}

impl std::error::Error for PlatformError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_host_passes() {
        assert_eq!(check(), Ok(()));
    }

    #[test]
    fn test_endianness_mismatch_detected() {
        let flipped = !cfg!(target_endian = "big");
        assert!(matches!(
            check_endianness(flipped),
            Err(PlatformError::Endianness { .. })
        ));
    }

    #[test]
    fn test_unsupported_pointer_width() {
        assert_eq!(
            check_pointer_width(16),
            Err(PlatformError::PointerWidth { bits: 16 })
        );
        assert_eq!(check_pointer_width(64), Ok(()));
    }
}
