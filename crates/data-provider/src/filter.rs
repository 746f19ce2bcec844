// SPDX-License-Identifier: GPL-3.0

//! Filter and sort criteria.
//!
//! Criteria are plain, structurally comparable values: the cache decides whether two
//! fetches ask the same question by comparing them with `==`. Evaluation against JSON
//! rows is provided for leaf providers that hold [`serde_json::Value`] data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison applied by an attribute filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeOperator {
	/// Equal.
	#[serde(rename = "$eq")]
	Eq,
	/// Not equal.
	#[serde(rename = "$ne")]
	Ne,
	/// Less than.
	#[serde(rename = "$lt")]
	Lt,
	/// Less than or equal.
	#[serde(rename = "$le")]
	Le,
	/// Greater than.
	#[serde(rename = "$gt")]
	Gt,
	/// Greater than or equal.
	#[serde(rename = "$ge")]
	Ge,
	/// String contains (case-insensitive).
	#[serde(rename = "$co")]
	Contains,
	/// String starts with (case-insensitive).
	#[serde(rename = "$sw")]
	StartsWith,
	/// String ends with (case-insensitive).
	#[serde(rename = "$ew")]
	EndsWith,
	/// Attribute is present and not null.
	#[serde(rename = "$pr")]
	Present,
}

/// A filter over rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FilterCriterion {
	/// Compare one attribute against a value. Dotted attribute names reach into objects.
	Attribute {
		/// Comparison to apply.
		operator: AttributeOperator,
		/// Attribute path.
		attribute: String,
		/// Right-hand side. Ignored by [`AttributeOperator::Present`].
		#[serde(default)]
		value: Value,
	},
	/// All criteria must match.
	And {
		/// Nested criteria.
		criteria: Vec<FilterCriterion>,
	},
	/// At least one criterion must match.
	Or {
		/// Nested criteria.
		criteria: Vec<FilterCriterion>,
	},
	/// The criterion must not match.
	Not {
		/// Negated criterion.
		criterion: Box<FilterCriterion>,
	},
	/// Any string attribute contains the text (case-insensitive).
	Text {
		/// Text to search for.
		text: String,
	},
}

impl FilterCriterion {
	/// Attribute filter shorthand.
	pub fn attribute(operator: AttributeOperator, attribute: impl Into<String>, value: Value) -> Self {
		Self::Attribute { operator, attribute: attribute.into(), value }
	}

	/// Equality filter shorthand.
	pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::attribute(AttributeOperator::Eq, attribute, value.into())
	}

	/// Returns `true` if `row` satisfies the filter.
	pub fn matches(&self, row: &Value) -> bool {
		match self {
			Self::Attribute { operator, attribute, value } =>
				matches_attribute(*operator, lookup(row, attribute), value),
			Self::And { criteria } => criteria.iter().all(|c| c.matches(row)),
			Self::Or { criteria } => criteria.iter().any(|c| c.matches(row)),
			Self::Not { criterion } => !criterion.matches(row),
			Self::Text { text } => contains_text(row, &text.to_lowercase()),
		}
	}
}

fn lookup<'a>(row: &'a Value, path: &str) -> Option<&'a Value> {
	path.split('.').try_fold(row, |current, segment| current.get(segment))
}

fn matches_attribute(operator: AttributeOperator, actual: Option<&Value>, expected: &Value) -> bool {
	use AttributeOperator::*;
	let Some(actual) = actual else {
		return operator == Ne;
	};
	match operator {
		Eq => actual == expected,
		Ne => actual != expected,
		Lt => compare_values(actual, expected) == Some(Ordering::Less),
		Le => matches!(compare_values(actual, expected), Some(Ordering::Less | Ordering::Equal)),
		Gt => compare_values(actual, expected) == Some(Ordering::Greater),
		Ge => matches!(compare_values(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
		Contains | StartsWith | EndsWith => {
			let (Some(actual), Some(expected)) = (actual.as_str(), expected.as_str()) else {
				return false;
			};
			let (actual, expected) = (actual.to_lowercase(), expected.to_lowercase());
			match operator {
				Contains => actual.contains(&expected),
				StartsWith => actual.starts_with(&expected),
				_ => actual.ends_with(&expected),
			}
		},
		Present => !actual.is_null(),
	}
}

fn contains_text(value: &Value, needle: &str) -> bool {
	match value {
		Value::String(s) => s.to_lowercase().contains(needle),
		Value::Array(values) => values.iter().any(|v| contains_text(v, needle)),
		Value::Object(map) => map.values().any(|v| contains_text(v, needle)),
		_ => false,
	}
}

/// Orders two JSON scalars of the same kind. Mixed kinds are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
	match (a, b) {
		(Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
		(Value::String(a), Value::String(b)) => Some(a.cmp(b)),
		(Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
		(Value::Null, Value::Null) => Some(Ordering::Equal),
		_ => None,
	}
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
	/// Smallest first.
	#[default]
	Ascending,
	/// Largest first.
	Descending,
}

/// Orders rows by one attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortCriterion {
	/// Attribute path.
	pub attribute: String,
	/// Direction.
	#[serde(default)]
	pub direction: SortDirection,
}

impl SortCriterion {
	/// Ascending order on `attribute`.
	pub fn ascending(attribute: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), direction: SortDirection::Ascending }
	}

	/// Descending order on `attribute`.
	pub fn descending(attribute: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), direction: SortDirection::Descending }
	}

	/// Compare two rows. Missing or incomparable values sort last.
	pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
		let ordering = match (lookup(a, &self.attribute), lookup(b, &self.attribute)) {
			(Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
			(Some(_), None) => return Ordering::Less,
			(None, Some(_)) => return Ordering::Greater,
			(None, None) => Ordering::Equal,
		};
		match self.direction {
			SortDirection::Ascending => ordering,
			SortDirection::Descending => ordering.reverse(),
		}
	}

	/// Compare two rows by a list of criteria, most significant first.
	pub fn compare_all(criteria: &[SortCriterion], a: &Value, b: &Value) -> Ordering {
		criteria
			.iter()
			.map(|c| c.compare(a, b))
			.find(|ordering| *ordering != Ordering::Equal)
			.unwrap_or(Ordering::Equal)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn attribute_operators_match() {
		let row = json!({"name": "Alpha", "age": 30, "address": {"city": "Lisbon"}});

		assert!(FilterCriterion::equals("name", "Alpha").matches(&row));
		assert!(FilterCriterion::attribute(AttributeOperator::Gt, "age", json!(18)).matches(&row));
		assert!(!FilterCriterion::attribute(AttributeOperator::Lt, "age", json!(18)).matches(&row));
		assert!(FilterCriterion::attribute(AttributeOperator::StartsWith, "name", json!("al")).matches(&row));
		assert!(FilterCriterion::equals("address.city", "Lisbon").matches(&row));
		assert!(!FilterCriterion::attribute(AttributeOperator::Present, "missing", Value::Null).matches(&row));
	}

	#[test]
	fn compound_filters_match() {
		let row = json!({"name": "Beta", "active": true});
		let filter = FilterCriterion::And {
			criteria: vec![
				FilterCriterion::equals("active", true),
				FilterCriterion::Not { criterion: Box::new(FilterCriterion::equals("name", "Alpha")) },
			],
		};
		assert!(filter.matches(&row));
		assert!(FilterCriterion::Text { text: "BET".into() }.matches(&row));
	}

	#[test]
	fn filters_deserialize_from_json() {
		let filter: FilterCriterion =
			serde_json::from_value(json!({"op": "attribute", "operator": "$eq", "attribute": "id", "value": 3}))
				.unwrap();
		assert_eq!(filter, FilterCriterion::equals("id", 3));
	}

	#[test]
	fn sort_respects_direction_and_missing_values() {
		let a = json!({"n": 1});
		let b = json!({"n": 2});
		let missing = json!({});

		assert_eq!(SortCriterion::ascending("n").compare(&a, &b), Ordering::Less);
		assert_eq!(SortCriterion::descending("n").compare(&a, &b), Ordering::Greater);
		assert_eq!(SortCriterion::ascending("n").compare(&a, &missing), Ordering::Less);
	}
}
