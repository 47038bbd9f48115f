use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::Deserializer;
use void::{ResultVoidExt, Void};

/// A Visitor implementation that is able to parse either an integer or a string.
/// Strings are kept verbatim so that conversion errors can name the offending field later.
pub fn integer_or_string<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: From<i64> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct IntegerOrString<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for IntegerOrString<T>
    where
        T: From<i64> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("integer or string")
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(T::from(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            match i64::try_from(value) {
                Ok(value) => Ok(T::from(value)),
                Err(_) => Ok(T::from_str(&value.to_string()).void_unwrap()),
            }
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(T::from_str(value).void_unwrap())
        }
    }

    deserializer.deserialize_any(IntegerOrString(PhantomData))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::resources::ParamValue;

    #[derive(Debug, Deserialize)]
    struct Param(#[serde(deserialize_with = "integer_or_string")] ParamValue);

    fn parse(yaml: &str) -> ParamValue {
        serde_yaml::from_str::<Param>(yaml).unwrap().0
    }

    #[test]
    fn test_integer_or_string() {
        assert_eq!(parse("8"), ParamValue::Integer(8));
        assert_eq!(parse("-1"), ParamValue::Integer(-1));
        assert_eq!(parse("\"8\""), ParamValue::from("8"));
        assert_eq!(parse("two"), ParamValue::from("two"));
        // Too large for `i64`, kept as text.
        assert_eq!(
            parse("18446744073709551615"),
            ParamValue::from("18446744073709551615")
        );
        assert!(serde_yaml::from_str::<Param>("[1, 2]").is_err());
    }
}
