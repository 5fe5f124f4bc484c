//! HTTP style status code carried in management responses

use std::num::NonZeroU16;

use fe2o3_amqp_types::primitives::SimpleValue;

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct StatusCode(pub NonZeroU16);

impl StatusCode {
    /// Whether the code falls in the 2xx success window
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0.get())
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&SimpleValue> for StatusCode {
    type Error = ();

    fn try_from(value: &SimpleValue) -> Result<Self, Self::Error> {
        let code: u16 = match value {
            SimpleValue::Ushort(v) => *v,
            SimpleValue::Short(v) => u16::try_from(*v).map_err(|_| ())?,
            SimpleValue::Uint(v) => u16::try_from(*v).map_err(|_| ())?,
            SimpleValue::Int(v) => u16::try_from(*v).map_err(|_| ())?,
            SimpleValue::Ulong(v) => u16::try_from(*v).map_err(|_| ())?,
            SimpleValue::Long(v) => u16::try_from(*v).map_err(|_| ())?,
            _ => return Err(()),
        };
        NonZeroU16::new(code).map(StatusCode).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use fe2o3_amqp_types::primitives::SimpleValue;

    use super::StatusCode;

    #[test]
    fn accepts_the_numeric_encodings_used_by_services() {
        for value in [
            SimpleValue::Int(202),
            SimpleValue::Uint(202),
            SimpleValue::Ushort(202),
            SimpleValue::Long(202),
        ] {
            let code = StatusCode::try_from(&value).unwrap();
            assert_eq!(code.0.get(), 202);
            assert!(code.is_success());
        }
    }

    #[test]
    fn rejects_non_numeric_values() {
        assert!(StatusCode::try_from(&SimpleValue::String("ok".to_string())).is_err());
    }

    #[test]
    fn non_2xx_is_not_success() {
        let code = StatusCode(NonZeroU16::new(404).unwrap());
        assert!(!code.is_success());
    }
}
