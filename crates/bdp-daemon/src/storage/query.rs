//! Parameterized search-query builder.
//!
//! Builds the dynamic id searches (property filters, date buckets, keyword
//! matching with URL-prefix normalization) against a domain's main table.
//! The statement text is assembled from schema constants and `?`
//! placeholders only; every caller value is bound, never interpolated.
//!
//! Two entry points exist on [`StorageEngine`]:
//!
//! - [`StorageEngine::find_ids`]: the conditioned/ordered search. Honors the
//!   raw-search flag.
//! - [`StorageEngine::find_duplicate_ids`]: the duplicate-detection search
//!   used before inserts. It deliberately ignores the raw-search flag and
//!   always normalizes; the original daemon only threads the flag through
//!   the date-conditioned path and this asymmetry is load-bearing for
//!   deployed clients.

use bdp_core::search::{DateBucket, KeywordFilter, KeywordScope, SearchQuery};
use chrono::{Days, Local, NaiveDate, TimeZone, Utc};
use rusqlite::types::Value;

use super::engine::{unix_time, StorageEngine, StorageError, StorageResult, MAX_RESULT_ROWS};
use super::schema::{DomainSchema, FieldKind, FIELD_BM_IS_OPERATOR, FIELD_BM_PARENT, FIELD_BM_TYPE};

impl StorageEngine {
    /// Conditioned/ordered id search. See module docs.
    pub fn find_ids(&self, query: &SearchQuery) -> StorageResult<Vec<i64>> {
        self.run_search(query, true)
    }

    /// Duplicate-detection search: keyword matching always normalizes,
    /// whatever the raw flag says.
    pub fn find_duplicate_ids(&self, query: &SearchQuery) -> StorageResult<Vec<i64>> {
        self.run_search(query, false)
    }

    fn run_search(&self, query: &SearchQuery, honor_raw: bool) -> StorageResult<Vec<i64>> {
        let schema = self.schema();
        let (where_clause, params) = build_where(schema, query, honor_raw)?;
        let order_column = order_column(schema, query.order_field)?;
        let direction = if query.descending { "DESC" } else { "ASC" };

        // Clamp the limit by an actual count rather than trusting the
        // caller's raw input to size the reply.
        let limit = match query.limit {
            Some(limit) => limit.min(MAX_RESULT_ROWS),
            None => {
                let count_sql =
                    format!("SELECT COUNT(*) FROM {} WHERE {where_clause}", schema.main_table);
                self.query_count(&count_sql, &params)?.min(MAX_RESULT_ROWS)
            },
        };

        let sql = format!(
            "SELECT id FROM {} WHERE {where_clause} \
             ORDER BY {order_column} {direction}, id ASC LIMIT {limit} OFFSET {}",
            schema.main_table, query.offset
        );
        self.query_ids(&sql, &params)
    }
}

fn order_column(schema: &'static DomainSchema, order_field: u32) -> StorageResult<&'static str> {
    if order_field == 0 {
        return Ok("date_created");
    }
    schema
        .field(order_field)
        .map(|f| f.column)
        .ok_or(StorageError::InvalidParameter("unknown order field"))
}

fn build_where(
    schema: &'static DomainSchema,
    query: &SearchQuery,
    honor_raw: bool,
) -> StorageResult<(String, Vec<Value>)> {
    let mut clauses = vec!["is_deleted = 0".to_owned()];
    let mut params: Vec<Value> = Vec::new();

    if let Some(parent) = query.parent {
        let field = int_filter_field(schema, FIELD_BM_PARENT)?;
        clauses.push(format!("{field} = ?"));
        params.push(Value::Integer(parent));
    }
    if let Some(item_type) = query.item_type {
        let field = int_filter_field(schema, FIELD_BM_TYPE)?;
        clauses.push(format!("{field} = ?"));
        params.push(Value::Integer(item_type));
    }
    if let Some(is_operator) = query.is_operator {
        let field = int_filter_field(schema, FIELD_BM_IS_OPERATOR)?;
        clauses.push(format!("{field} = ?"));
        params.push(Value::Integer(is_operator));
    }
    if let Some(date) = query.date {
        let field = schema
            .field(date.field)
            .filter(|f| f.kind == FieldKind::Int)
            .ok_or(StorageError::InvalidParameter("date filter needs a timestamp field"))?;
        let (clause, mut bounds) = bucket_clause(field.column, date.bucket);
        clauses.push(clause);
        params.append(&mut bounds);
    }
    if let Some(keyword) = &query.keyword {
        let (clause, mut values) = keyword_clause(schema, keyword, honor_raw)?;
        clauses.push(clause);
        params.append(&mut values);
    }

    Ok((clauses.join(" AND "), params))
}

fn int_filter_field(schema: &'static DomainSchema, field_id: u32) -> StorageResult<&'static str> {
    schema
        .field(field_id)
        .filter(|f| f.kind == FieldKind::Int)
        .map(|f| f.column)
        .ok_or(StorageError::InvalidParameter("property filter not supported by this domain"))
}

/// Local-midnight boundary for a date, falling back to UTC when the local
/// wall clock skips midnight (DST transitions).
fn local_midnight(date: NaiveDate) -> i64 {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is a valid wall-clock time");
    naive
        .and_local_timezone(Local)
        .earliest()
        .map_or_else(|| Utc.from_utc_datetime(&naive).timestamp(), |dt| dt.timestamp())
}

fn days_before(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days)).unwrap_or(date)
}

fn days_after(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(date)
}

fn bucket_clause(column: &str, bucket: DateBucket) -> (String, Vec<Value>) {
    let today = Local::now().date_naive();
    let midnight = local_midnight(today);
    match bucket {
        DateBucket::Today => (
            format!("{column} >= ? AND {column} < ?"),
            vec![
                Value::Integer(midnight),
                Value::Integer(local_midnight(days_after(today, 1))),
            ],
        ),
        DateBucket::Yesterday => (
            format!("{column} >= ? AND {column} < ?"),
            vec![
                Value::Integer(local_midnight(days_before(today, 1))),
                Value::Integer(midnight),
            ],
        ),
        DateBucket::LastSevenDays => (
            format!("{column} >= ? AND {column} <= ?"),
            vec![
                Value::Integer(local_midnight(days_before(today, 7))),
                Value::Integer(unix_time()),
            ],
        ),
        DateBucket::LastMonth => (
            format!("{column} >= ? AND {column} <= ?"),
            vec![
                Value::Integer(local_midnight(days_before(today, 30))),
                Value::Integer(unix_time()),
            ],
        ),
        DateBucket::Older => (
            format!("{column} < ?"),
            vec![Value::Integer(local_midnight(days_before(today, 30)))],
        ),
    }
}

fn keyword_clause(
    schema: &'static DomainSchema,
    keyword: &KeywordFilter,
    honor_raw: bool,
) -> StorageResult<(String, Vec<Value>)> {
    let raw = honor_raw && keyword.raw;
    let pattern = keyword.keyword.to_lowercase();
    let mut branches: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    let wants_title =
        matches!(keyword.scope, KeywordScope::Title | KeywordScope::TitleOrUrl);
    let wants_url = matches!(keyword.scope, KeywordScope::Url | KeywordScope::TitleOrUrl);

    if wants_title {
        let column = schema
            .title_column
            .ok_or(StorageError::InvalidParameter("domain has no title column"))?;
        branches.push(format!("lower({column}) LIKE ?"));
        params.push(Value::Text(pattern.clone()));
    }
    if wants_url {
        let column = schema
            .url_column
            .ok_or(StorageError::InvalidParameter("domain has no url column"))?;
        for variant in url_patterns(&pattern, raw) {
            branches.push(format!("lower({column}) LIKE ?"));
            params.push(Value::Text(variant));
        }
    }

    // Title-or-URL is an OR ("inquired") search, not an intersection.
    Ok((format!("({})", branches.join(" OR ")), params))
}

/// URL match variants for one lowercased keyword pattern.
///
/// Stored URLs carry `http(s)://` and often `www.` prefixes the user never
/// types, so the pattern is also tried with those prefixes prepended. A
/// keyword that itself starts with `www.` gets the opposite treatment too:
/// its bare remainder is tried so `www.example` still matches
/// `http://example.com`. Raw mode skips all of it.
fn url_patterns(pattern: &str, raw: bool) -> Vec<String> {
    if raw {
        return vec![pattern.to_owned()];
    }
    if let Some(stripped) = pattern.strip_prefix("www.") {
        vec![
            pattern.to_owned(),
            format!("http://{pattern}"),
            format!("https://{pattern}"),
            stripped.to_owned(),
            format!("http://{stripped}"),
            format!("https://{stripped}"),
        ]
    } else {
        vec![
            pattern.to_owned(),
            format!("http://{pattern}"),
            format!("https://{pattern}"),
            format!("www.{pattern}"),
            format!("http://www.{pattern}"),
            format!("https://www.{pattern}"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use bdp_core::search::DateFilter;
    use bdp_core::DomainFamily;
    use tempfile::TempDir;

    use super::super::schema::{schema_for, FIELD_DATE_CREATED, FIELD_TITLE, FIELD_URL};
    use super::super::engine::FieldValue;
    use super::*;

    fn engine(tmp: &TempDir, family: DomainFamily) -> StorageEngine {
        let schema = schema_for(family);
        StorageEngine::open(tmp.path().join(schema.db_file), schema).unwrap()
    }

    fn add_bookmark(engine: &StorageEngine, title: &str, url: &str) -> i64 {
        let id = engine.create(-1).unwrap();
        engine
            .set_fields(
                id,
                &[
                    (FIELD_TITLE, FieldValue::Text(title.into())),
                    (FIELD_URL, FieldValue::Text(url.into())),
                ],
            )
            .unwrap();
        id
    }

    fn keyword(pattern: &str, scope: KeywordScope, raw: bool) -> SearchQuery {
        SearchQuery {
            keyword: Some(KeywordFilter { keyword: pattern.into(), scope, raw }),
            ..SearchQuery::default()
        }
    }

    #[test]
    fn keyword_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        let id = add_bookmark(&engine, "My Homepage", "http://example.com");

        let hits = engine.find_ids(&keyword("%homepage%", KeywordScope::Title, false)).unwrap();
        assert_eq!(hits, vec![id]);
        let hits = engine.find_ids(&keyword("%HOMEPAGE%", KeywordScope::Title, false)).unwrap();
        assert_eq!(hits, vec![id]);
    }

    #[test]
    fn url_prefix_normalization_properties() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        let with_www = add_bookmark(&engine, "a", "http://www.example.com");
        let bare = add_bookmark(&engine, "b", "example.com");

        // Both fragment shapes match the fully-prefixed stored URL.
        let hits = engine.find_ids(&keyword("www.example%", KeywordScope::Url, false)).unwrap();
        assert!(hits.contains(&with_www));
        let hits = engine.find_ids(&keyword("example%", KeywordScope::Url, false)).unwrap();
        assert!(hits.contains(&with_www));

        // The www-fragment also reaches a stored URL without the prefix.
        let no_www = add_bookmark(&engine, "c", "http://example.org");
        let hits = engine.find_ids(&keyword("www.example%", KeywordScope::Url, false)).unwrap();
        assert!(hits.contains(&no_www));

        // Raw search does none of that.
        let hits = engine.find_ids(&keyword("www.example%", KeywordScope::Url, true)).unwrap();
        assert!(!hits.contains(&bare));
        assert!(!hits.contains(&no_www));
    }

    #[test]
    fn duplicate_search_ignores_raw_flag() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        let no_www = add_bookmark(&engine, "c", "http://example.org");

        let query = keyword("www.example%", KeywordScope::Url, true);
        // find_ids honors raw and misses; the duplicate path normalizes
        // regardless and hits.
        assert!(!engine.find_ids(&query).unwrap().contains(&no_www));
        assert!(engine.find_duplicate_ids(&query).unwrap().contains(&no_www));
    }

    #[test]
    fn inquired_search_is_a_union() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        let title_hit = add_bookmark(&engine, "example site", "http://other.net");
        let url_hit = add_bookmark(&engine, "unrelated", "http://example.com");

        let hits = engine
            .find_ids(&keyword("%example%", KeywordScope::TitleOrUrl, false))
            .unwrap();
        assert!(hits.contains(&title_hit));
        assert!(hits.contains(&url_hit));
    }

    #[test]
    fn search_is_idempotent_without_mutation() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        add_bookmark(&engine, "one", "http://a.com");
        add_bookmark(&engine, "two", "http://a.org");

        let query = keyword("%a.%", KeywordScope::Url, false);
        let first = engine.find_ids(&query).unwrap();
        let second = engine.find_ids(&query).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn property_filters_narrow_results() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        let folder = engine.create(-1).unwrap();
        let inside = add_bookmark(&engine, "in", "http://in.com");
        let outside = add_bookmark(&engine, "out", "http://out.com");
        engine.set_int(inside, FIELD_BM_PARENT, folder).unwrap();

        let query = SearchQuery { parent: Some(folder), ..SearchQuery::default() };
        let hits = engine.find_ids(&query).unwrap();
        assert!(hits.contains(&inside));
        assert!(!hits.contains(&outside));
        assert!(!hits.contains(&folder));
    }

    #[test]
    fn property_filter_unsupported_by_domain_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::History);
        let query = SearchQuery { parent: Some(0), ..SearchQuery::default() };
        assert!(matches!(
            engine.find_ids(&query),
            Err(StorageError::InvalidParameter(_))
        ));
    }

    #[test]
    fn date_buckets_split_today_and_older() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::History);
        let today_id = engine.create(-1).unwrap();
        let old_id = engine.create(-1).unwrap();
        // Push one record far into the past via its creation stamp.
        engine.set_int(old_id, FIELD_DATE_CREATED, 1000).unwrap();

        let today = SearchQuery {
            date: Some(DateFilter { field: FIELD_DATE_CREATED, bucket: DateBucket::Today }),
            ..SearchQuery::default()
        };
        let hits = engine.find_ids(&today).unwrap();
        assert!(hits.contains(&today_id));
        assert!(!hits.contains(&old_id));

        let older = SearchQuery {
            date: Some(DateFilter { field: FIELD_DATE_CREATED, bucket: DateBucket::Older }),
            ..SearchQuery::default()
        };
        let hits = engine.find_ids(&older).unwrap();
        assert!(hits.contains(&old_id));
        assert!(!hits.contains(&today_id));
    }

    #[test]
    fn explicit_limit_and_order_are_applied() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        engine.create(10).unwrap();
        engine.create(20).unwrap();
        engine.create(30).unwrap();

        let query = SearchQuery {
            limit: Some(2),
            descending: true,
            order_field: 0,
            ..SearchQuery::default()
        };
        let hits = engine.find_ids(&query).unwrap();
        assert_eq!(hits.len(), 2);

        let query = SearchQuery { limit: Some(1), offset: 1, ..SearchQuery::default() };
        let hits = engine.find_ids(&query).unwrap();
        assert_eq!(hits, vec![20]);
    }

    #[test]
    fn missing_limit_is_clamped_by_count() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        for _ in 0..5 {
            engine.create(-1).unwrap();
        }
        let hits = engine.find_ids(&SearchQuery::default()).unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn unknown_order_field_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, DomainFamily::Bookmark);
        let query = SearchQuery { order_field: 9999, ..SearchQuery::default() };
        assert!(matches!(
            engine.find_ids(&query),
            Err(StorageError::InvalidParameter(_))
        ));
    }

    #[test]
    fn url_pattern_variants() {
        let plain = url_patterns("example%", false);
        assert!(plain.contains(&"http://www.example%".to_owned()));
        assert!(plain.contains(&"https://example%".to_owned()));

        let www = url_patterns("www.example%", false);
        assert!(www.contains(&"http://example%".to_owned()));
        assert!(www.contains(&"https://www.example%".to_owned()));

        assert_eq!(url_patterns("www.example%", true), vec!["www.example%".to_owned()]);
    }
}
