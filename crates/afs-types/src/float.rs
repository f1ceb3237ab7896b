//! serde codecs for doubles that JSON numbers cannot carry.
//!
//! Finite values stay JSON numbers. NaN and the infinities are written as
//! the strings `"NaN"`, `"Infinity"` and `"-Infinity"`. A `null` reads back
//! as NaN.

use serde::{Deserialize, Serialize};

const NAN: &str = "NaN";
const INFINITY: &str = "Infinity";
const NEG_INFINITY: &str = "-Infinity";

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JsonDouble {
    Number(f64),
    Text(String),
}

fn encode(value: f64) -> JsonDouble {
    if value.is_finite() {
        JsonDouble::Number(value)
    } else if value.is_nan() {
        JsonDouble::Text(NAN.to_string())
    } else if value > 0.0 {
        JsonDouble::Text(INFINITY.to_string())
    } else {
        JsonDouble::Text(NEG_INFINITY.to_string())
    }
}

fn decode(value: Option<JsonDouble>) -> Result<f64, String> {
    match value {
        None => Ok(f64::NAN),
        Some(JsonDouble::Number(v)) => Ok(v),
        Some(JsonDouble::Text(text)) => match text.as_str() {
            NAN => Ok(f64::NAN),
            INFINITY => Ok(f64::INFINITY),
            NEG_INFINITY => Ok(f64::NEG_INFINITY),
            other => Err(format!("invalid double: {:?}", other)),
        },
    }
}

/// `#[serde(with = "...")]` codec for `Vec<f64>`.
pub(crate) mod seq {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{decode, encode, JsonDouble};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| encode(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Option<JsonDouble>>::deserialize(deserializer)?
            .into_iter()
            .map(|v| decode(v).map_err(D::Error::custom))
            .collect()
    }
}

/// `#[serde(with = "...")]` codec for `BTreeMap<String, f64>`.
pub(crate) mod map {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{decode, encode, JsonDouble};

    pub fn serialize<S: Serializer>(
        values: &BTreeMap<String, f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(values.iter().map(|(k, v)| (k, encode(*v))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, f64>, D::Error> {
        BTreeMap::<String, Option<JsonDouble>>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| decode(v).map(|v| (k, v)).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Values {
        #[serde(with = "super::seq")]
        values: Vec<f64>,
    }

    #[derive(Serialize, Deserialize)]
    struct Named {
        #[serde(with = "super::map")]
        named: BTreeMap<String, f64>,
    }

    #[test]
    fn test_non_finite_values_are_tagged() {
        let values = Values {
            values: vec![f64::INFINITY, f64::NEG_INFINITY, f64::NAN, 1.0],
        };
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"{"values":["Infinity","-Infinity","NaN",1.0]}"#);

        let decoded: Values = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.values[0], f64::INFINITY);
        assert_eq!(decoded.values[1], f64::NEG_INFINITY);
        assert!(decoded.values[2].is_nan());
        assert_eq!(decoded.values[3], 1.0);
    }

    #[test]
    fn test_null_and_integers_decode() {
        let decoded: Values = serde_json::from_str(r#"{"values":[null,3]}"#).unwrap();
        assert!(decoded.values[0].is_nan());
        assert_eq!(decoded.values[1], 3.0);
    }

    #[test]
    fn test_unknown_text_is_rejected() {
        assert!(serde_json::from_str::<Values>(r#"{"values":["inf"]}"#).is_err());
    }

    #[test]
    fn test_map_roundtrip() {
        let mut named = BTreeMap::new();
        named.insert("nan".to_string(), f64::NAN);
        named.insert("neg".to_string(), f64::NEG_INFINITY);
        named.insert("one".to_string(), 1.5);
        let json = serde_json::to_string(&Named { named }).unwrap();
        assert_eq!(json, r#"{"named":{"nan":"NaN","neg":"-Infinity","one":1.5}}"#);

        let decoded: Named = serde_json::from_str(&json).unwrap();
        assert!(decoded.named["nan"].is_nan());
        assert_eq!(decoded.named["neg"], f64::NEG_INFINITY);
        assert_eq!(decoded.named["one"], 1.5);
    }
}
