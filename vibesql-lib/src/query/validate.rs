//! Reject statements that violate the shape contract before any engine
//! round trip.

use std::sync::LazyLock;

use regex::Regex;

use super::QueryError;

/// Largest accepted statement, in raw bytes.
pub const MAX_STATEMENT_BYTES: usize = 10_240;

/// Leading keywords admitted on the query surface.
pub const PERMITTED_KEYWORDS: [&str; 8] = [
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "TRUNCATE",
];

static WHERE_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWHERE\b").expect("invalid regex (for matching the WHERE keyword)")
});

/// Validate a raw statement. The rules apply in order:
///
/// 1. after trimming whitespace the statement must be non-empty;
/// 2. the raw byte length must not exceed [`MAX_STATEMENT_BYTES`];
/// 3. the first token must be one of [`PERMITTED_KEYWORDS`];
/// 4. `UPDATE` and `DELETE` must carry a `WHERE` token outside string
///    literals and comments.
pub fn validate(sql: &str) -> Result<(), QueryError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(QueryError::missing_required_field());
    }
    if sql.len() > MAX_STATEMENT_BYTES {
        return Err(QueryError::new(
            super::ErrorKind::QueryTooLarge,
            "Query exceeds the maximum size",
        )
        .with_detail(format!(
            "statement is {} bytes; the limit is {MAX_STATEMENT_BYTES} bytes",
            sql.len()
        )));
    }
    let keyword = leading_keyword(trimmed);
    if !PERMITTED_KEYWORDS.iter().any(|permitted| keyword.eq_ignore_ascii_case(permitted)) {
        return Err(QueryError::invalid_sql(format!(
            "Statement must begin with one of: {}",
            PERMITTED_KEYWORDS.join(", ")
        )));
    }
    let mutation = keyword.eq_ignore_ascii_case("UPDATE") || keyword.eq_ignore_ascii_case("DELETE");
    if mutation && !contains_where(trimmed) {
        return Err(QueryError::unsafe_query());
    }
    Ok(())
}

fn leading_keyword(sql: &str) -> &str {
    let end = sql.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(sql.len());
    &sql[..end]
}

/// True when the statement contains a `WHERE` token with word boundaries on
/// both sides, ignoring comments and string literals.
fn contains_where(sql: &str) -> bool {
    WHERE_WORD.is_match(&mask(sql))
}

/// Strip comments and replace string literals with empty placeholders so
/// that a `WHERE` inside either cannot satisfy the safety rule.
///
/// A doubled single quote inside a literal denotes an escaped quote. Nested
/// block-comment delimiters are not honoured, matching the engine default.
fn mask(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for rest in chars.by_ref() {
                    if rest == '\n' {
                        masked.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for rest in chars.by_ref() {
                    if previous == '*' && rest == '/' {
                        break;
                    }
                    previous = rest;
                }
                masked.push(' ');
            }
            '\'' => {
                masked.push_str("''");
                while let Some(inner) = chars.next() {
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            other => masked.push(other),
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::super::ErrorKind;
    use super::{contains_where, mask, validate, MAX_STATEMENT_BYTES};

    fn kind_of(sql: &str) -> Option<ErrorKind> {
        validate(sql).err().map(|error| error.kind)
    }

    #[test]
    fn empty_and_blank_statements_are_missing_field() {
        assert_eq!(kind_of(""), Some(ErrorKind::MissingRequiredField));
        assert_eq!(kind_of("   \n\t "), Some(ErrorKind::MissingRequiredField));
    }

    #[test]
    fn oversized_statement_is_too_large() {
        let sql = format!("SELECT '{}'", "x".repeat(MAX_STATEMENT_BYTES));
        assert_eq!(kind_of(&sql), Some(ErrorKind::QueryTooLarge));
    }

    #[test]
    fn statement_at_the_limit_is_accepted() {
        let sql = format!("SELECT '{}'", "x".repeat(MAX_STATEMENT_BYTES - 9));
        assert_eq!(sql.len(), MAX_STATEMENT_BYTES);
        assert_eq!(kind_of(&sql), None);
    }

    #[test]
    fn permitted_keywords_are_accepted_case_insensitively() {
        assert_eq!(kind_of("SELECT 1"), None);
        assert_eq!(kind_of("select 1"), None);
        assert_eq!(kind_of("  Insert INTO t VALUES (1)"), None);
        assert_eq!(kind_of("CREATE TABLE t (id INT)"), None);
        assert_eq!(kind_of("DROP TABLE IF EXISTS t"), None);
        assert_eq!(kind_of("ALTER TABLE t ADD COLUMN c INT"), None);
        assert_eq!(kind_of("TRUNCATE t"), None);
    }

    #[test]
    fn unknown_leading_keyword_is_invalid() {
        assert_eq!(kind_of("SELECTX BAD"), Some(ErrorKind::InvalidSql));
        assert_eq!(kind_of("EXPLAIN SELECT 1"), Some(ErrorKind::InvalidSql));
        assert_eq!(kind_of("-- comment"), Some(ErrorKind::InvalidSql));
    }

    #[test]
    fn update_and_delete_require_where() {
        assert_eq!(kind_of("UPDATE users SET name='x'"), Some(ErrorKind::UnsafeQuery));
        assert_eq!(kind_of("DELETE FROM users"), Some(ErrorKind::UnsafeQuery));
        assert_eq!(kind_of("UPDATE users SET name='x' WHERE id=1"), None);
        assert_eq!(kind_of("delete from users where id=1"), None);
    }

    #[test]
    fn where_bypass_idiom_is_accepted() {
        assert_eq!(kind_of("UPDATE users SET name='x' WHERE 1=1"), None);
    }

    #[test]
    fn where_inside_a_line_comment_does_not_count() {
        assert_eq!(
            kind_of("UPDATE users SET name='x' -- WHERE id=1"),
            Some(ErrorKind::UnsafeQuery)
        );
    }

    #[test]
    fn where_inside_a_block_comment_does_not_count() {
        assert_eq!(
            kind_of("DELETE FROM users /* WHERE id=1 */"),
            Some(ErrorKind::UnsafeQuery)
        );
    }

    #[test]
    fn where_inside_a_string_literal_does_not_count() {
        assert_eq!(
            kind_of("UPDATE users SET name='WHERE id=1'"),
            Some(ErrorKind::UnsafeQuery)
        );
        assert_eq!(
            kind_of("UPDATE users SET name='it''s WHERE' "),
            Some(ErrorKind::UnsafeQuery)
        );
    }

    #[test]
    fn where_after_a_comment_still_counts() {
        assert_eq!(kind_of("DELETE FROM users -- audit\nWHERE id=1"), None);
        assert_eq!(kind_of("DELETE FROM users /* audit */ WHERE id=1"), None);
    }

    #[test]
    fn where_requires_word_boundaries() {
        assert_eq!(
            kind_of("DELETE FROM somewhere_table"),
            Some(ErrorKind::UnsafeQuery)
        );
        assert!(!contains_where("SELECT somewhere FROM nowhere"));
        assert!(contains_where("SELECT 1 WHERE true"));
        assert!(contains_where("select 1 where true"));
    }

    #[test]
    fn mask_replaces_literals_with_empty_placeholders() {
        assert_eq!(mask("SELECT 'WHERE'"), "SELECT ''");
        assert_eq!(mask("SELECT 'it''s'"), "SELECT ''");
    }

    #[test]
    fn mask_preserves_separation_around_comments() {
        assert_eq!(mask("a/* x */b"), "a b");
        assert_eq!(mask("a -- x\nb"), "a \nb");
    }

    #[test]
    fn mask_does_not_honour_nested_block_comments() {
        // The inner `/*` does not nest, so `*/ b` survives the mask.
        assert_eq!(mask("a /* x /* y */ b */"), "a  b */");
    }

    #[test]
    fn unterminated_literal_masks_to_the_end() {
        assert_eq!(mask("UPDATE t SET a='oops WHERE"), "UPDATE t SET a=''");
    }
}
