//! Filter, update, sort and projection evaluation for the in-memory driver
//!
//! Supports the subset of the query language the handles exercise:
//! equality (with array containment), `$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
//! `$lte`, `$in`, `$nin`, `$exists`, `$and`, `$or`, `$nor` and dotted paths.
//! Updates support `$set`, `$unset`, `$inc`, `$push`, `$setOnInsert` and
//! whole-document replacement.

use bson::{Bson, Document};
use std::cmp::Ordering;

use crate::error::{Error, Result};

const BAD_VALUE: i32 = 2;
const IMMUTABLE_FIELD: i32 = 66;

fn bad_value(message: String) -> Error {
	Error::server(BAD_VALUE, message)
}

/// Value at a dotted path
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
	let mut parts = path.split('.');
	let mut current = doc.get(parts.next()?)?;
	for part in parts {
		current = match current {
			Bson::Document(d) => d.get(part)?,
			Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
			_ => return None,
		};
	}
	Some(current)
}

fn as_f64(value: &Bson) -> Option<f64> {
	match value {
		Bson::Int32(n) => Some(f64::from(*n)),
		Bson::Int64(n) => Some(*n as f64),
		Bson::Double(n) => Some(*n),
		_ => None,
	}
}

/// Canonical type order used when values of different types are compared
fn type_rank(value: Option<&Bson>) -> u8 {
	match value {
		None | Some(Bson::Null) | Some(Bson::Undefined) => 0,
		Some(Bson::Int32(_)) | Some(Bson::Int64(_)) | Some(Bson::Double(_)) => 1,
		Some(Bson::String(_)) | Some(Bson::Symbol(_)) => 2,
		Some(Bson::Document(_)) => 3,
		Some(Bson::Array(_)) => 4,
		Some(Bson::Binary(_)) => 5,
		Some(Bson::ObjectId(_)) => 6,
		Some(Bson::Boolean(_)) => 7,
		Some(Bson::DateTime(_)) => 8,
		Some(Bson::Timestamp(_)) => 9,
		Some(_) => 10,
	}
}

/// Total order over optional values: by type first, then by value
pub(crate) fn compare(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
	let rank = type_rank(a).cmp(&type_rank(b));
	if rank != Ordering::Equal {
		return rank;
	}
	match (a, b) {
		(Some(x), Some(y)) => {
			if let (Some(x), Some(y)) = (as_f64(x), as_f64(y)) {
				return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
			}
			match (x, y) {
				(Bson::String(x), Bson::String(y)) => x.cmp(y),
				(Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
				(Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
				(Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
				(Bson::Timestamp(x), Bson::Timestamp(y)) => {
					(x.time, x.increment).cmp(&(y.time, y.increment))
				}
				(Bson::Array(x), Bson::Array(y)) => {
					for (x, y) in x.iter().zip(y.iter()) {
						let ord = compare(Some(x), Some(y));
						if ord != Ordering::Equal {
							return ord;
						}
					}
					x.len().cmp(&y.len())
				}
				(Bson::Document(x), Bson::Document(y)) => {
					for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
						let ord = kx.cmp(ky).then_with(|| compare(Some(vx), Some(vy)));
						if ord != Ordering::Equal {
							return ord;
						}
					}
					x.len().cmp(&y.len())
				}
				_ => Ordering::Equal,
			}
		}
		_ => Ordering::Equal,
	}
}

/// Equality with numeric values compared across integer and double types
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
	match (as_f64(a), as_f64(b)) {
		(Some(x), Some(y)) => x == y,
		_ => a == b,
	}
}

/// Whether the field value equals `expected`, or contains it when an array
fn field_equals(value: Option<&Bson>, expected: &Bson) -> bool {
	match value {
		None => matches!(expected, Bson::Null),
		Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
			items.iter().any(|item| values_equal(item, expected))
		}
		Some(value) => values_equal(value, expected),
	}
}

fn ordered_match(value: Option<&Bson>, bound: &Bson, accept: fn(Ordering) -> bool) -> bool {
	let candidates: Vec<&Bson> = match value {
		None => return false,
		Some(Bson::Array(items)) => items.iter().collect(),
		Some(v) => vec![v],
	};
	candidates.into_iter().any(|candidate| {
		// Ranges never cross types
		type_rank(Some(candidate)) == type_rank(Some(bound))
			&& accept(compare(Some(candidate), Some(bound)))
	})
}

fn is_operator_document(value: &Bson) -> Option<&Document> {
	match value {
		Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => Some(d),
		_ => None,
	}
}

fn array_operand<'a>(op: &str, operand: &'a Bson) -> Result<&'a Vec<Bson>> {
	match operand {
		Bson::Array(items) => Ok(items),
		_ => Err(bad_value(format!("{} needs an array", op))),
	}
}

fn condition_matches(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
	let Some(ops) = is_operator_document(condition) else {
		return Ok(field_equals(value, condition));
	};

	for (op, operand) in ops {
		let matched = match op.as_str() {
			"$eq" => field_equals(value, operand),
			"$ne" => !field_equals(value, operand),
			"$gt" => ordered_match(value, operand, |o| o == Ordering::Greater),
			"$gte" => ordered_match(value, operand, |o| o != Ordering::Less),
			"$lt" => ordered_match(value, operand, |o| o == Ordering::Less),
			"$lte" => ordered_match(value, operand, |o| o != Ordering::Greater),
			"$in" => array_operand(op, operand)?
				.iter()
				.any(|candidate| field_equals(value, candidate)),
			"$nin" => !array_operand(op, operand)?
				.iter()
				.any(|candidate| field_equals(value, candidate)),
			"$exists" => {
				let wanted = match operand {
					Bson::Boolean(b) => *b,
					other => as_f64(other).is_some_and(|n| n != 0.0),
				};
				value.is_some() == wanted
			}
			other => return Err(bad_value(format!("unknown operator: {}", other))),
		};
		if !matched {
			return Ok(false);
		}
	}
	Ok(true)
}

fn clauses<'a>(op: &str, operand: &'a Bson) -> Result<Vec<&'a Document>> {
	let items = array_operand(op, operand)?;
	if items.is_empty() {
		return Err(bad_value(format!("{} must be a nonempty array", op)));
	}
	items
		.iter()
		.map(|item| match item {
			Bson::Document(d) => Ok(d),
			_ => Err(bad_value(format!("{} entries need to be full objects", op))),
		})
		.collect()
}

/// Whether `doc` satisfies `filter`
pub(crate) fn matches(doc: &Document, filter: &Document) -> Result<bool> {
	for (key, condition) in filter {
		let matched = match key.as_str() {
			"$and" => {
				let mut all = true;
				for clause in clauses(key, condition)? {
					if !matches(doc, clause)? {
						all = false;
						break;
					}
				}
				all
			}
			"$or" | "$nor" => {
				let mut any = false;
				for clause in clauses(key, condition)? {
					if matches(doc, clause)? {
						any = true;
						break;
					}
				}
				if key == "$or" { any } else { !any }
			}
			"$comment" => true,
			op if op.starts_with('$') => {
				return Err(bad_value(format!("unknown top level operator: {}", op)));
			}
			path => condition_matches(lookup(doc, path), condition)?,
		};
		if !matched {
			return Ok(false);
		}
	}
	Ok(true)
}

/// Set the value at a dotted path, creating intermediate documents
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
	match path.split_once('.') {
		None => {
			doc.insert(path, value);
			Ok(())
		}
		Some((head, rest)) => {
			if !doc.contains_key(head) {
				doc.insert(head, Document::new());
			}
			match doc.get_mut(head) {
				Some(Bson::Document(child)) => set_path(child, rest, value),
				_ => Err(bad_value(format!(
					"cannot create field '{}' in element {{{}: ...}}",
					rest, head
				))),
			}
		}
	}
}

fn unset_path(doc: &mut Document, path: &str) {
	match path.split_once('.') {
		None => {
			doc.remove(path);
		}
		Some((head, rest)) => {
			if let Some(Bson::Document(child)) = doc.get_mut(head) {
				unset_path(child, rest);
			}
		}
	}
}

/// Whether `update` is made of `$` operators rather than a replacement
pub(crate) fn is_operator_update(update: &Document) -> bool {
	update.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn operator_fields<'a>(op: &str, operand: &'a Bson) -> Result<&'a Document> {
	match operand {
		Bson::Document(d) => Ok(d),
		_ => Err(bad_value(format!("modifier {} needs a document", op))),
	}
}

fn guard_id(path: &str) -> Result<()> {
	if path == "_id" || path.starts_with("_id.") {
		return Err(Error::server(
			IMMUTABLE_FIELD,
			format!(
				"Performing an update on the path '{}' would modify the immutable field '_id'",
				path
			),
		));
	}
	Ok(())
}

fn as_i64(value: &Bson) -> Option<i64> {
	match value {
		Bson::Int32(n) => Some(i64::from(*n)),
		Bson::Int64(n) => Some(*n),
		_ => None,
	}
}

fn add(a: &Bson, b: &Bson) -> Option<Bson> {
	match (a, b) {
		(Bson::Int32(x), Bson::Int32(y)) => Some(match x.checked_add(*y) {
			Some(n) => Bson::Int32(n),
			None => Bson::Int64(i64::from(*x) + i64::from(*y)),
		}),
		(Bson::Int64(_) | Bson::Int32(_), Bson::Int64(_) | Bson::Int32(_)) => {
			Some(Bson::Int64(as_i64(a)?.checked_add(as_i64(b)?)?))
		}
		_ => Some(Bson::Double(as_f64(a)? + as_f64(b)?)),
	}
}

/// Apply an update document in place
///
/// `inserting` enables `$setOnInsert`. A replacement keeps the `_id` of
/// `doc`.
pub(crate) fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<()> {
	if !is_operator_update(update) {
		if update.keys().any(|k| k.starts_with('$')) {
			return Err(bad_value(
				"update document mixes operators and fields".to_string(),
			));
		}
		let id = doc.get("_id").cloned();
		if let (Some(id), Some(new_id)) = (&id, update.get("_id")) {
			if !values_equal(id, new_id) {
				guard_id("_id")?;
			}
		}
		let mut replacement = Document::new();
		if let Some(id) = id {
			replacement.insert("_id", id);
		}
		for (key, value) in update {
			if key != "_id" {
				replacement.insert(key.clone(), value.clone());
			}
		}
		*doc = replacement;
		return Ok(());
	}

	for (op, operand) in update {
		let fields = operator_fields(op, operand)?;
		match op.as_str() {
			"$set" => {
				for (path, value) in fields {
					if lookup(doc, path).is_some_and(|old| values_equal(old, value)) {
						continue;
					}
					guard_id(path)?;
					set_path(doc, path, value.clone())?;
				}
			}
			"$setOnInsert" => {
				if inserting {
					for (path, value) in fields {
						set_path(doc, path, value.clone())?;
					}
				}
			}
			"$unset" => {
				for path in fields.keys() {
					guard_id(path)?;
					unset_path(doc, path);
				}
			}
			"$inc" => {
				for (path, delta) in fields {
					guard_id(path)?;
					if as_f64(delta).is_none() {
						return Err(bad_value(format!(
							"Cannot increment with non-numeric argument: {{{}: {}}}",
							path, delta
						)));
					}
					let updated = match lookup(doc, path) {
						None => delta.clone(),
						Some(current) => add(current, delta).ok_or_else(|| {
							bad_value(format!(
								"Cannot apply $inc to a value of non-numeric type at {}",
								path
							))
						})?,
					};
					set_path(doc, path, updated)?;
				}
			}
			"$push" => {
				for (path, value) in fields {
					guard_id(path)?;
					let mut items = match lookup(doc, path) {
						None => Vec::new(),
						Some(Bson::Array(items)) => items.clone(),
						Some(_) => {
							return Err(bad_value(format!(
								"The field '{}' must be an array",
								path
							)));
						}
					};
					items.push(value.clone());
					set_path(doc, path, Bson::Array(items))?;
				}
			}
			other => {
				return Err(bad_value(format!("Unknown modifier: {}", other)));
			}
		}
	}
	Ok(())
}

/// Base document of an upsert: the equality fields of the selector
pub(crate) fn upsert_base(selector: &Document) -> Result<Document> {
	let mut base = Document::new();
	for (key, value) in selector {
		if key.starts_with('$') {
			continue;
		}
		match is_operator_document(value) {
			None => set_path(&mut base, key, value.clone())?,
			Some(ops) => {
				if let Some(eq) = ops.get("$eq") {
					set_path(&mut base, key, eq.clone())?;
				}
			}
		}
	}
	Ok(base)
}

/// Apply a projection such as `{a: 1, b: 1}` or `{secret: 0}`
pub(crate) fn project(doc: &Document, projection: &Document) -> Document {
	let mut include_id = true;
	let mut inclusions = Vec::new();
	let mut exclusions = Vec::new();
	for (path, flag) in projection {
		// `{score: {$meta: "textScore"}}` and friends have no stored value
		if matches!(flag, Bson::Document(_)) {
			continue;
		}
		let on = match flag {
			Bson::Boolean(b) => *b,
			other => as_f64(other).is_none_or(|n| n != 0.0),
		};
		if path == "_id" {
			include_id = on;
		} else if on {
			inclusions.push(path.as_str());
		} else {
			exclusions.push(path.as_str());
		}
	}

	if inclusions.is_empty() {
		let mut out = doc.clone();
		for path in exclusions {
			unset_path(&mut out, path);
		}
		if !include_id {
			out.remove("_id");
		}
		return out;
	}

	let mut out = Document::new();
	if include_id {
		if let Some(id) = doc.get("_id") {
			out.insert("_id", id.clone());
		}
	}
	for path in inclusions {
		if let Some(value) = lookup(doc, path) {
			// Paths below arrays are not reconstructed
			let _ = set_path(&mut out, path, value.clone());
		}
	}
	out
}

/// Order two documents by a parsed sort document
///
/// `$natural` orders by insertion sequence; `$meta` keys are ignored.
pub(crate) fn sort_order(
	sort: &Document,
	(a_seq, a): (u64, &Document),
	(b_seq, b): (u64, &Document),
) -> Ordering {
	for (path, direction) in sort {
		if matches!(direction, Bson::Document(_)) {
			continue;
		}
		let descending = as_f64(direction).is_some_and(|n| n < 0.0);
		let ord = if path == "$natural" {
			a_seq.cmp(&b_seq)
		} else {
			compare(lookup(a, path), lookup(b, path))
		};
		let ord = if descending { ord.reverse() } else { ord };
		if ord != Ordering::Equal {
			return ord;
		}
	}
	a_seq.cmp(&b_seq)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bson::doc;
	use rstest::rstest;

	fn person() -> Document {
		doc! {
			"_id": 1,
			"name": "Ada",
			"age": 36,
			"tags": ["math", "engines"],
			"address": { "city": "London", "zip": "W1" },
		}
	}

	#[rstest]
	#[case(doc! {}, true)]
	#[case(doc! { "name": "Ada" }, true)]
	#[case(doc! { "name": "Alan" }, false)]
	#[case(doc! { "age": 36.0 }, true)]
	#[case(doc! { "tags": "math" }, true)]
	#[case(doc! { "address.city": "London" }, true)]
	#[case(doc! { "age": { "$gt": 30, "$lte": 36 } }, true)]
	#[case(doc! { "age": { "$lt": 30 } }, false)]
	#[case(doc! { "age": { "$gt": "30" } }, false)]
	#[case(doc! { "name": { "$in": ["Alan", "Ada"] } }, true)]
	#[case(doc! { "name": { "$nin": ["Alan", "Ada"] } }, false)]
	#[case(doc! { "name": { "$ne": "Alan" } }, true)]
	#[case(doc! { "email": { "$exists": false } }, true)]
	#[case(doc! { "email": null }, true)]
	#[case(doc! { "$or": [{ "name": "Alan" }, { "age": 36 }] }, true)]
	#[case(doc! { "$and": [{ "name": "Ada" }, { "age": 37 }] }, false)]
	#[case(doc! { "$nor": [{ "name": "Alan" }] }, true)]
	fn test_matches(#[case] filter: Document, #[case] expected: bool) {
		assert_eq!(matches(&person(), &filter).unwrap(), expected);
	}

	#[rstest]
	#[case(doc! { "age": { "$regex": "3" } })]
	#[case(doc! { "$where": "this.age > 3" })]
	#[case(doc! { "$or": [] })]
	fn test_unsupported_filters_are_server_errors(#[case] filter: Document) {
		let err = matches(&person(), &filter).unwrap_err();
		assert_eq!(err.code(), Some(2));
	}

	#[rstest]
	fn test_operator_update() {
		let mut doc = person();
		apply_update(
			&mut doc,
			&doc! {
				"$set": { "address.city": "Paris", "title": "Countess" },
				"$inc": { "age": 1 },
				"$push": { "tags": "poetry" },
				"$unset": { "address.zip": "" },
			},
			false,
		)
		.unwrap();

		assert_eq!(doc.get_i32("age").unwrap(), 37);
		assert_eq!(lookup(&doc, "address.city"), Some(&Bson::String("Paris".into())));
		assert_eq!(lookup(&doc, "address.zip"), None);
		assert_eq!(doc.get_array("tags").unwrap().len(), 3);
		assert_eq!(doc.get_str("title").unwrap(), "Countess");
	}

	#[rstest]
	fn test_replacement_keeps_id() {
		let mut doc = person();
		apply_update(&mut doc, &doc! { "name": "Grace" }, false).unwrap();
		assert_eq!(doc, doc! { "_id": 1, "name": "Grace" });
	}

	#[rstest]
	fn test_changing_id_is_rejected() {
		let mut doc = person();
		let err = apply_update(&mut doc, &doc! { "$set": { "_id": 2 } }, false).unwrap_err();
		assert_eq!(err.code(), Some(66));

		// Setting the same value is a no-op
		apply_update(&mut doc, &doc! { "$set": { "_id": 1 } }, false).unwrap();
	}

	#[rstest]
	fn test_set_on_insert_only_when_inserting() {
		let mut doc = doc! { "_id": 1 };
		apply_update(&mut doc, &doc! { "$setOnInsert": { "created": true } }, false).unwrap();
		assert!(!doc.contains_key("created"));
		apply_update(&mut doc, &doc! { "$setOnInsert": { "created": true } }, true).unwrap();
		assert!(doc.get_bool("created").unwrap());
	}

	#[rstest]
	fn test_upsert_base_takes_equality_fields() {
		let base = upsert_base(&doc! {
			"name": "Ada",
			"age": { "$gt": 3 },
			"kind": { "$eq": "person" },
			"$or": [{ "x": 1 }],
		})
		.unwrap();
		assert_eq!(base, doc! { "name": "Ada", "kind": "person" });
	}

	#[rstest]
	fn test_projection() {
		assert_eq!(
			project(&person(), &doc! { "name": 1, "address.city": 1 }),
			doc! { "_id": 1, "name": "Ada", "address": { "city": "London" } }
		);
		assert_eq!(
			project(&person(), &doc! { "name": 1, "_id": 0 }),
			doc! { "name": "Ada" }
		);
		let excluded = project(&person(), &doc! { "tags": 0, "address": 0 });
		assert_eq!(excluded, doc! { "_id": 1, "name": "Ada", "age": 36 });
	}

	#[rstest]
	fn test_sort_order_handles_missing_and_mixed_types() {
		let sort = doc! { "age": -1 };
		let young = doc! { "age": 3 };
		let old = doc! { "age": 40.5 };
		let unknown = doc! {};
		assert_eq!(sort_order(&sort, (1, &old), (2, &young)), Ordering::Less);
		assert_eq!(sort_order(&sort, (1, &unknown), (2, &young)), Ordering::Greater);
		// Ties keep insertion order
		assert_eq!(sort_order(&sort, (1, &young), (2, &young)), Ordering::Less);
	}
}
