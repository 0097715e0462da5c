//! Command documents and reply parsing for the MongoDB driver

use bson::{Bson, Document, doc};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::{Index, parse_index_key, parse_sort};
use crate::types::{
	BuildInfo, ChangeInfo, CollectionInfo, MapReduce, MapReduceInfo, Namespace, PipeOptions,
	QuerySpec,
};

fn malformed(what: &str, err: impl std::fmt::Display) -> Error {
	Error::Driver(format!("malformed {} reply: {}", what, err))
}

fn millis(d: Duration) -> i64 {
	i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Magnitude of a signed limit; a negative limit only selects single-batch mode
fn limit_magnitude(limit: i64) -> i64 {
	i64::try_from(limit.unsigned_abs()).unwrap_or(i64::MAX)
}

/// Integer reply field, whatever numeric type the server picked
pub(crate) fn get_number(reply: &Document, key: &str) -> Option<i64> {
	match reply.get(key)? {
		Bson::Int32(n) => Some(i64::from(*n)),
		Bson::Int64(n) => Some(*n),
		Bson::Double(n) => Some(*n as i64),
		_ => None,
	}
}

fn get_count(reply: &Document, key: &str) -> u64 {
	get_number(reply, key).map_or(0, |n| n.max(0) as u64)
}

/// Fail with the first write error of a write command reply
pub(crate) fn check_write_errors(reply: &Document) -> Result<()> {
	if let Ok(errors) = reply.get_array("writeErrors") {
		if let Some(Bson::Document(first)) = errors.first() {
			let code = get_number(first, "code").unwrap_or(0) as i32;
			let message = first.get_str("errmsg").unwrap_or("write error");
			return Err(Error::server(code, message));
		}
	}
	if let Ok(concern) = reply.get_document("writeConcernError") {
		let code = get_number(concern, "code").unwrap_or(0) as i32;
		let message = concern.get_str("errmsg").unwrap_or("write concern error");
		return Err(Error::server(code, message));
	}
	Ok(())
}

/// Server cursor id and batch of a `find`, `aggregate`, `listIndexes` or
/// `getMore` reply
pub(crate) fn parse_cursor(reply: &Document, batch: &str) -> Result<(i64, Vec<Document>)> {
	let cursor = reply.get_document("cursor").map_err(|e| malformed("cursor", e))?;
	let id = get_number(cursor, "id").unwrap_or(0);
	let docs = cursor
		.get_array(batch)
		.map_err(|e| malformed("cursor", e))?
		.iter()
		.filter_map(|value| value.as_document().cloned())
		.collect();
	Ok((id, docs))
}

pub(crate) fn find(ns: &Namespace, spec: &QuerySpec) -> Result<Document> {
	let mut cmd = doc! {
		"find": ns.collection.as_str(),
		"filter": spec.filter.clone(),
	};
	if let Some(projection) = &spec.projection {
		cmd.insert("projection", projection.clone());
	}
	if !spec.sort.is_empty() {
		cmd.insert("sort", parse_sort(&spec.sort)?);
	}
	if spec.skip > 0 {
		cmd.insert("skip", spec.skip as i64);
	}
	if spec.limit != 0 {
		cmd.insert("limit", limit_magnitude(spec.limit));
		if spec.limit < 0 {
			cmd.insert("singleBatch", true);
		}
	}
	if spec.batch_size > 0 {
		cmd.insert("batchSize", i64::from(spec.batch_size));
	}
	if !spec.hint.is_empty() {
		cmd.insert("hint", parse_index_key(&spec.hint)?.key);
	}
	if spec.max_scan > 0 {
		cmd.insert("maxScan", spec.max_scan as i64);
	}
	if let Some(max_time) = spec.max_time {
		cmd.insert("maxTimeMS", millis(max_time));
	}
	if spec.snapshot {
		cmd.insert("snapshot", true);
	}
	if let Some(comment) = &spec.comment {
		cmd.insert("comment", comment.as_str());
	}
	if spec.log_replay {
		cmd.insert("oplogReplay", true);
	}
	if spec.tailable {
		cmd.insert("tailable", true);
		cmd.insert("awaitData", true);
	}
	Ok(cmd)
}

pub(crate) fn get_more(ns: &Namespace, cursor_id: i64, batch_size: u32, max_await: Option<Duration>) -> Document {
	let mut cmd = doc! {
		"getMore": cursor_id,
		"collection": ns.collection.as_str(),
	};
	if batch_size > 0 {
		cmd.insert("batchSize", i64::from(batch_size));
	}
	if let Some(wait) = max_await {
		cmd.insert("maxTimeMS", millis(wait));
	}
	cmd
}

pub(crate) fn kill_cursors(ns: &Namespace, cursor_id: i64) -> Document {
	doc! {
		"killCursors": ns.collection.as_str(),
		"cursors": [cursor_id],
	}
}

pub(crate) fn count(ns: &Namespace, spec: &QuerySpec) -> Result<Document> {
	let mut cmd = doc! {
		"count": ns.collection.as_str(),
		"query": spec.filter.clone(),
	};
	if spec.skip > 0 {
		cmd.insert("skip", spec.skip as i64);
	}
	if spec.limit != 0 {
		cmd.insert("limit", limit_magnitude(spec.limit));
	}
	if !spec.hint.is_empty() {
		cmd.insert("hint", parse_index_key(&spec.hint)?.key);
	}
	if let Some(max_time) = spec.max_time {
		cmd.insert("maxTimeMS", millis(max_time));
	}
	Ok(cmd)
}

pub(crate) fn create(ns: &Namespace, info: &CollectionInfo) -> Document {
	let mut cmd = doc! { "create": ns.collection.as_str() };
	if info.capped {
		cmd.insert("capped", true);
		cmd.insert("size", info.max_bytes as i64);
		if info.max_docs > 0 {
			cmd.insert("max", info.max_docs as i64);
		}
	}
	if info.disable_id_index {
		cmd.insert("autoIndexId", false);
	}
	if info.force_id_index {
		cmd.insert("autoIndexId", true);
	}
	if let Some(validator) = &info.validator {
		cmd.insert("validator", validator.clone());
	}
	if let Some(level) = &info.validation_level {
		cmd.insert("validationLevel", level.as_str());
	}
	if let Some(action) = &info.validation_action {
		cmd.insert("validationAction", action.as_str());
	}
	if let Some(engine) = &info.storage_engine {
		cmd.insert("storageEngine", engine.clone());
	}
	cmd
}

/// Index specification as sent to `createIndexes`
///
/// `drop_dups` is not sent; servers since 3.0 reject or ignore it.
pub(crate) fn index_spec(index: &Index) -> Result<Document> {
	let key = index.parse_key()?;
	let mut spec = doc! {
		"key": key.key,
		"name": index.key_name()?,
	};
	if index.unique {
		spec.insert("unique", true);
	}
	if index.background {
		spec.insert("background", true);
	}
	if index.sparse {
		spec.insert("sparse", true);
	}
	if let Some(ttl) = index.expire_after {
		spec.insert("expireAfterSeconds", ttl.as_secs() as i64);
	}
	if let Some(bits) = index.bits {
		spec.insert("bits", i64::from(bits));
	}
	if let Some(min) = index.min {
		spec.insert("min", min);
	}
	if let Some(max) = index.max {
		spec.insert("max", max);
	}
	if let Some(language) = &index.default_language {
		spec.insert("default_language", language.as_str());
	}
	if let Some(field) = &index.language_override {
		spec.insert("language_override", field.as_str());
	}
	if let Some(filter) = &index.partial_filter {
		spec.insert("partialFilterExpression", filter.clone());
	}
	Ok(spec)
}

/// Index description from a `listIndexes` entry
pub(crate) fn parse_index(spec: &Document) -> Result<Index> {
	let key = spec.get_document("key").map_err(|e| malformed("listIndexes", e))?;
	let mut fields = Vec::with_capacity(key.len());
	for (field, kind) in key {
		match kind {
			Bson::String(kind) => fields.push(format!("${}:{}", kind, field)),
			other => {
				let descending = match other {
					Bson::Int32(n) => *n < 0,
					Bson::Int64(n) => *n < 0,
					Bson::Double(n) => *n < 0.0,
					_ => false,
				};
				fields.push(if descending {
					format!("-{}", field)
				} else {
					field.clone()
				});
			}
		}
	}

	let mut index = Index::new(fields);
	index.name = spec.get_str("name").ok().map(str::to_string);
	index.unique = spec.get_bool("unique").unwrap_or(false);
	index.background = spec.get_bool("background").unwrap_or(false);
	index.sparse = spec.get_bool("sparse").unwrap_or(false);
	index.expire_after = get_number(spec, "expireAfterSeconds").map(|s| Duration::from_secs(s.max(0) as u64));
	index.bits = get_number(spec, "bits").map(|b| b as u32);
	index.min = spec.get_f64("min").ok();
	index.max = spec.get_f64("max").ok();
	index.default_language = spec.get_str("default_language").ok().map(str::to_string);
	index.language_override = spec.get_str("language_override").ok().map(str::to_string);
	index.partial_filter = spec.get_document("partialFilterExpression").ok().cloned();
	Ok(index)
}

pub(crate) fn delete(ns: &Namespace, selector: &Document, multi: bool) -> Document {
	let limit = if multi { 0 } else { 1 };
	doc! {
		"delete": ns.collection.as_str(),
		"deletes": [{ "q": selector.clone(), "limit": limit }],
	}
}

pub(crate) fn parse_delete(reply: &Document) -> Result<ChangeInfo> {
	check_write_errors(reply)?;
	let n = get_count(reply, "n");
	Ok(ChangeInfo {
		removed: n,
		matched: n,
		..Default::default()
	})
}

pub(crate) fn update(
	ns: &Namespace,
	selector: &Document,
	update: &Document,
	multi: bool,
	upsert: bool,
) -> Document {
	doc! {
		"update": ns.collection.as_str(),
		"updates": [{
			"q": selector.clone(),
			"u": update.clone(),
			"multi": multi,
			"upsert": upsert,
		}],
	}
}

pub(crate) fn parse_update(reply: &Document) -> Result<ChangeInfo> {
	check_write_errors(reply)?;
	let upserted_id = reply
		.get_array("upserted")
		.ok()
		.and_then(|upserted| upserted.first())
		.and_then(Bson::as_document)
		.and_then(|first| first.get("_id").cloned());
	let upserts = u64::from(upserted_id.is_some());
	Ok(ChangeInfo {
		updated: get_count(reply, "nModified"),
		removed: 0,
		// `n` counts upserted documents too
		matched: get_count(reply, "n").saturating_sub(upserts),
		upserted_id,
	})
}

pub(crate) fn find_and_modify(
	ns: &Namespace,
	spec: &QuerySpec,
	change: &crate::types::Change,
) -> Result<Document> {
	let mut cmd = doc! {
		"findAndModify": ns.collection.as_str(),
		"query": spec.filter.clone(),
	};
	if !spec.sort.is_empty() {
		cmd.insert("sort", parse_sort(&spec.sort)?);
	}
	if let Some(projection) = &spec.projection {
		cmd.insert("fields", projection.clone());
	}
	if change.remove {
		cmd.insert("remove", true);
	} else if let Some(update) = &change.update {
		cmd.insert("update", update.clone());
		cmd.insert("new", change.return_new);
		cmd.insert("upsert", change.upsert);
	}
	if let Some(max_time) = spec.max_time {
		cmd.insert("maxTimeMS", millis(max_time));
	}
	Ok(cmd)
}

pub(crate) fn parse_find_and_modify(reply: &Document, remove: bool) -> (ChangeInfo, Option<Document>) {
	let doc = reply.get_document("value").ok().cloned();
	let mut info = ChangeInfo::default();
	if let Ok(last) = reply.get_document("lastErrorObject") {
		let n = get_count(last, "n");
		info.upserted_id = last.get("upserted").cloned();
		if remove {
			info.removed = n;
			info.matched = n;
		} else if info.upserted_id.is_none() {
			info.updated = n;
			info.matched = n;
		}
	}
	(info, doc)
}

pub(crate) fn distinct(ns: &Namespace, key: &str, spec: &QuerySpec) -> Document {
	let mut cmd = doc! {
		"distinct": ns.collection.as_str(),
		"key": key,
		"query": spec.filter.clone(),
	};
	if let Some(max_time) = spec.max_time {
		cmd.insert("maxTimeMS", millis(max_time));
	}
	cmd
}

pub(crate) fn map_reduce(ns: &Namespace, spec: &QuerySpec, job: &MapReduce) -> Result<Document> {
	let mut cmd = doc! {
		"mapReduce": ns.collection.as_str(),
		"map": Bson::JavaScriptCode(job.map.clone()),
		"reduce": Bson::JavaScriptCode(job.reduce.clone()),
		"out": job.out.clone().unwrap_or_else(|| doc! { "inline": 1 }),
		"query": spec.filter.clone(),
	};
	if let Some(finalize) = &job.finalize {
		cmd.insert("finalize", Bson::JavaScriptCode(finalize.clone()));
	}
	if !spec.sort.is_empty() {
		cmd.insert("sort", parse_sort(&spec.sort)?);
	}
	if spec.limit != 0 {
		cmd.insert("limit", limit_magnitude(spec.limit));
	}
	if let Some(scope) = &job.scope {
		cmd.insert("scope", scope.clone());
	}
	if job.verbose {
		cmd.insert("verbose", true);
	}
	Ok(cmd)
}

pub(crate) fn parse_map_reduce(reply: &Document) -> (MapReduceInfo, Vec<Document>) {
	let mut info = MapReduceInfo::default();
	if let Ok(counts) = reply.get_document("counts") {
		info.input_count = get_count(counts, "input");
		info.emit_count = get_count(counts, "emit");
		info.output_count = get_count(counts, "output");
	}
	info.time = Duration::from_millis(get_count(reply, "timeMillis"));

	match reply.get("result") {
		Some(Bson::String(collection)) => info.collection = Some(collection.clone()),
		Some(Bson::Document(target)) => {
			info.collection = target.get_str("collection").ok().map(str::to_string);
			info.database = target.get_str("db").ok().map(str::to_string);
		}
		_ => {}
	}

	let results: Vec<Document> = reply
		.get_array("results")
		.map(|results| results.iter().filter_map(|r| r.as_document().cloned()).collect())
		.unwrap_or_default();
	if info.output_count == 0 {
		info.output_count = results.len() as u64;
	}
	(info, results)
}

pub(crate) fn aggregate(ns: &Namespace, pipeline: &[Document], options: &PipeOptions) -> Document {
	let mut cursor = Document::new();
	if options.batch_size > 0 {
		cursor.insert("batchSize", i64::from(options.batch_size));
	}
	let mut cmd = doc! {
		"aggregate": ns.collection.as_str(),
		"pipeline": pipeline.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
		"cursor": cursor,
	};
	if options.allow_disk_use {
		cmd.insert("allowDiskUse", true);
	}
	if let Some(max_time) = options.max_time {
		cmd.insert("maxTimeMS", millis(max_time));
	}
	cmd
}

pub(crate) fn parse_build_info(reply: &Document) -> BuildInfo {
	BuildInfo {
		version: reply.get_str("version").unwrap_or_default().to_string(),
		version_array: reply
			.get_array("versionArray")
			.map(|parts| {
				parts
					.iter()
					.filter_map(|part| match part {
						Bson::Int32(n) => Some(*n),
						Bson::Int64(n) => Some(*n as i32),
						_ => None,
					})
					.collect()
			})
			.unwrap_or_default(),
		git_version: reply.get_str("gitVersion").unwrap_or_default().to_string(),
		sys_info: reply.get_str("sysInfo").unwrap_or_default().to_string(),
		bits: get_number(reply, "bits").unwrap_or(0) as i32,
		debug: reply.get_bool("debug").unwrap_or(false),
		max_object_size: get_number(reply, "maxBsonObjectSize").unwrap_or(0),
	}
}
