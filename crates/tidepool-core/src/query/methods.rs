// ── Query method catalogue ──
//
// The closed set of chainable query methods a descriptor may contain,
// with the argument checks applied when a call is appended.

use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use super::QueryError;

/// A query method the server accepts in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum QueryMethod {
    All,
    And,
    #[strum(serialize = "box")]
    BoxShape,
    Circle,
    Comment,
    Count,
    Distinct,
    ElemMatch,
    Equals,
    Exists,
    Find,
    FindOne,
    Geometry,
    Gt,
    Gte,
    Hint,
    In,
    Intersects,
    Limit,
    Lt,
    Lte,
    MaxDistance,
    MaxScan,
    Mod,
    Ne,
    Near,
    Nin,
    Nor,
    Or,
    Polygon,
    Populate,
    Read,
    Regex,
    Select,
    Size,
    Skip,
    Slice,
    Sort,
    Where,
    Within,
}

impl QueryMethod {
    /// Whether the classification records this method's first argument
    /// rather than a plain `true` flag.
    pub(crate) fn records_argument(self) -> bool {
        matches!(
            self,
            Self::Limit | Self::Skip | Self::MaxScan | Self::Distinct
        )
    }

    /// Check the arguments of one call.
    pub fn validate(self, args: &[Value]) -> Result<(), QueryError> {
        let invalid = |reason: &str| QueryError::InvalidArguments {
            method: self.to_string(),
            reason: reason.to_owned(),
        };

        match self {
            Self::Limit | Self::Skip | Self::MaxScan => {
                if args.len() != 1 {
                    return Err(invalid("must be called with exactly one number argument"));
                }
                if !(args[0].is_i64() || args[0].is_u64()) {
                    return Err(invalid("argument must be an integer"));
                }
            }
            Self::Distinct
            | Self::Gt
            | Self::Gte
            | Self::Lt
            | Self::Lte
            | Self::BoxShape
            | Self::Circle
            | Self::Read => {
                if args.is_empty() {
                    return Err(invalid("requires at least one argument"));
                }
                if args.len() > 2 {
                    return Err(invalid("takes up to two arguments"));
                }
            }
            Self::And => {
                if args.len() != 1 || !args[0].is_array() {
                    return Err(invalid("takes exactly one array argument"));
                }
            }
            Self::Count | Self::Comment => {
                if args.len() > 1 {
                    return Err(invalid("takes at most one argument"));
                }
            }
            Self::FindOne => {
                if args.len() > 1 {
                    return Err(invalid("takes at most one argument"));
                }
                if args.first().is_some_and(|a| !a.is_object()) {
                    return Err(invalid("argument must be an object"));
                }
            }
            Self::Near => {
                if args.is_empty() || args.len() > 2 {
                    return Err(invalid("takes one or two arguments"));
                }
                if !args[0].is_object() {
                    return Err(invalid("first argument must be an object"));
                }
            }
            Self::Sort => {
                if args.is_empty() {
                    return Err(invalid("requires one argument"));
                }
                if args.len() > 1 {
                    return Err(invalid("takes only one argument"));
                }
                if !args[0].is_string() {
                    return Err(invalid("takes a string as an argument"));
                }
            }
            Self::Where => {
                if args.is_empty() || args.len() > 2 {
                    return Err(invalid("takes one or two arguments"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn wire_names_round_trip() {
        assert_eq!(QueryMethod::FindOne.as_ref(), "findOne");
        assert_eq!(QueryMethod::BoxShape.as_ref(), "box");
        assert_eq!(QueryMethod::MaxScan.to_string(), "maxScan");
        assert_eq!(QueryMethod::from_str("elemMatch").unwrap(), QueryMethod::ElemMatch);
        assert!(QueryMethod::from_str("aggregate").is_err());

        for method in QueryMethod::iter() {
            assert_eq!(QueryMethod::from_str(method.as_ref()).unwrap(), method);
        }
    }

    #[test]
    fn limit_requires_single_integer() {
        assert!(QueryMethod::Limit.validate(&[json!(10)]).is_ok());
        assert!(QueryMethod::Limit.validate(&[]).is_err());
        assert!(QueryMethod::Limit.validate(&[json!(1), json!(2)]).is_err());

        let err = QueryMethod::Skip.validate(&[json!(1.5)]).unwrap_err();
        assert_eq!(err.to_string(), "skip: argument must be an integer");
    }

    #[test]
    fn up_to_two_argument_methods() {
        assert!(QueryMethod::Distinct.validate(&[json!("tag")]).is_ok());
        assert!(QueryMethod::Gt.validate(&[json!("n"), json!(3)]).is_ok());
        assert!(QueryMethod::Lte.validate(&[]).is_err());
        assert!(QueryMethod::Read.validate(&[json!(1), json!(2), json!(3)]).is_err());
    }

    #[test]
    fn sort_takes_one_string() {
        assert!(QueryMethod::Sort.validate(&[json!("-created")]).is_ok());
        assert!(QueryMethod::Sort.validate(&[]).is_err());
        assert!(QueryMethod::Sort.validate(&[json!({"created": -1})]).is_err());
        assert!(QueryMethod::Sort.validate(&[json!("a"), json!("b")]).is_err());
    }

    #[test]
    fn shape_argument_checks() {
        assert!(QueryMethod::And.validate(&[json!([{"a": 1}])]).is_ok());
        assert!(QueryMethod::And.validate(&[json!({"a": 1})]).is_err());
        assert!(QueryMethod::FindOne.validate(&[]).is_ok());
        assert!(QueryMethod::FindOne.validate(&[json!("id")]).is_err());
        assert!(QueryMethod::Near.validate(&[json!({"center": [0, 0]})]).is_ok());
        assert!(QueryMethod::Near.validate(&[json!([0, 0])]).is_err());
        assert!(QueryMethod::Count.validate(&[json!({}), json!({})]).is_err());
        assert!(QueryMethod::Where.validate(&[json!("this.a > 1")]).is_ok());
        assert!(QueryMethod::Find.validate(&[json!(1), json!(2), json!(3)]).is_ok());
    }
}
