//! Lexical scan of MySQL statements.
//!
//! Only what routing needs survives: keywords and identifiers, user and
//! system variables, a handful of punctuation marks, and comment text (for
//! routing hints). String literals are reduced to a placeholder.

use super::ClassificationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lexeme {
    /// Keyword or unquoted identifier, uppercased
    Word(String),
    /// Backquoted identifier
    Quoted(String),
    /// `@name`
    UserVar(String),
    /// `@@name`, `@@session.name`
    SysVar(String),
    Number(String),
    /// Quoted string, contents dropped
    Literal,
    Assign,
    Eq,
    Comma,
    Dot,
    LParen,
    RParen,
    Semicolon,
    Other(char),
}

impl Lexeme {
    pub fn is_word(&self, keyword: &str) -> bool {
        matches!(self, Lexeme::Word(w) if w == keyword)
    }
}

#[derive(Debug, Default)]
pub struct Scan {
    pub lexemes: Vec<Lexeme>,
    pub comments: Vec<String>,
}

impl Scan {
    /// Statements separated by `;`, empty ones dropped
    pub fn statements(&self) -> Vec<&[Lexeme]> {
        self.lexemes
            .split(|l| *l == Lexeme::Semicolon)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

pub fn scan(sql: &str) -> Result<Scan, ClassificationError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = Scan::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '#' => i = line_comment(&chars, i + 1, &mut out),
            '-' if next == Some('-')
                && chars.get(i + 2).map_or(true, |c| c.is_whitespace()) =>
            {
                i = line_comment(&chars, i + 2, &mut out)
            }
            '/' if next == Some('*') => {
                let body_start = i + 2;
                let end = find_pair(&chars, body_start, '*', '/')
                    .ok_or_else(|| ClassificationError::Malformed("unterminated comment".into()))?;
                let body: String = chars[body_start..end].iter().collect();
                // /*! ... */ is executable by MySQL: scan its content as SQL
                if let Some(rest) = body.strip_prefix('!') {
                    let versioned = rest.trim_start_matches(|c: char| c.is_ascii_digit());
                    let inner = scan(versioned)?;
                    out.lexemes.extend(inner.lexemes);
                    out.comments.extend(inner.comments);
                } else {
                    out.comments.push(body);
                }
                i = end + 2;
            }
            '\'' | '"' => {
                i = skip_quoted(&chars, i + 1, c)
                    .ok_or_else(|| ClassificationError::Malformed("unterminated string".into()))?;
                out.lexemes.push(Lexeme::Literal);
            }
            '`' => {
                let end = skip_quoted(&chars, i + 1, '`')
                    .ok_or_else(|| ClassificationError::Malformed("unterminated identifier".into()))?;
                let name: String = chars[i + 1..end - 1].iter().collect();
                out.lexemes.push(Lexeme::Quoted(name.replace("``", "`")));
                i = end;
            }
            '@' => {
                let system = next == Some('@');
                let start = if system { i + 2 } else { i + 1 };
                let end = take_while(&chars, start, |c| c.is_alphanumeric() || "_$.".contains(c));
                let name: String = chars[start..end].iter().collect::<String>().to_ascii_lowercase();
                out.lexemes.push(if system { Lexeme::SysVar(name) } else { Lexeme::UserVar(name) });
                i = end;
            }
            ':' if next == Some('=') => {
                out.lexemes.push(Lexeme::Assign);
                i += 2;
            }
            '=' => {
                out.lexemes.push(Lexeme::Eq);
                i += 1;
            }
            ',' => {
                out.lexemes.push(Lexeme::Comma);
                i += 1;
            }
            '.' if !next.map_or(false, |c| c.is_ascii_digit()) => {
                out.lexemes.push(Lexeme::Dot);
                i += 1;
            }
            '(' => {
                out.lexemes.push(Lexeme::LParen);
                i += 1;
            }
            ')' => {
                out.lexemes.push(Lexeme::RParen);
                i += 1;
            }
            ';' => {
                out.lexemes.push(Lexeme::Semicolon);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let end = take_while(&chars, i, |c| c.is_ascii_alphanumeric() || c == '.');
                out.lexemes.push(Lexeme::Number(chars[i..end].iter().collect()));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let end = take_while(&chars, i, |c| c.is_alphanumeric() || c == '_' || c == '$');
                let word: String = chars[i..end].iter().collect();
                out.lexemes.push(Lexeme::Word(word.to_ascii_uppercase()));
                i = end;
            }
            other => {
                out.lexemes.push(Lexeme::Other(other));
                i += 1;
            }
        }
    }

    Ok(out)
}

fn line_comment(chars: &[char], start: usize, out: &mut Scan) -> usize {
    let end = take_while(chars, start, |c| c != '\n');
    out.comments.push(chars[start..end].iter().collect());
    end
}

fn take_while(chars: &[char], start: usize, pred: impl Fn(char) -> bool) -> usize {
    let mut i = start;
    while i < chars.len() && pred(chars[i]) {
        i += 1;
    }
    i
}

/// Index of `first` in the first occurrence of `first` `second`
fn find_pair(chars: &[char], start: usize, first: char, second: char) -> Option<usize> {
    (start..chars.len().saturating_sub(1)).find(|&i| chars[i] == first && chars[i + 1] == second)
}

/// Position just past the closing quote. Doubled quotes and, except for
/// backquotes, backslash escapes stay inside the literal.
fn skip_quoted(chars: &[char], mut i: usize, quote: char) -> Option<usize> {
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && quote != '`' {
            i += 2;
        } else if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
            } else {
                return Some(i + 1);
            }
        } else {
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(sql: &str) -> Vec<Lexeme> {
        scan(sql).unwrap().lexemes
    }

    #[test]
    fn test_variables_and_assignment() {
        assert_eq!(
            words("SELECT @a := @@session.sql_mode"),
            vec![
                Lexeme::Word("SELECT".into()),
                Lexeme::UserVar("a".into()),
                Lexeme::Assign,
                Lexeme::SysVar("session.sql_mode".into()),
            ]
        );
    }

    #[test]
    fn test_strings_hide_keywords() {
        let lexemes = words("SELECT 'it''s; DELETE' , \"x\\\"y\" FROM t");
        assert!(!lexemes.iter().any(|l| l.is_word("DELETE")));
        assert!(!lexemes.contains(&Lexeme::Semicolon));
        assert!(lexemes.iter().any(|l| l.is_word("FROM")));
    }

    #[test]
    fn test_comments_collected() {
        let scan = scan("SELECT 1 -- maxscale route to master\n/* note */ # tail").unwrap();
        assert_eq!(scan.comments.len(), 3);
        assert_eq!(scan.comments[0].trim(), "maxscale route to master");
        assert_eq!(scan.lexemes.len(), 2);
    }

    #[test]
    fn test_double_dash_needs_space() {
        let lexemes = words("SELECT 1--1");
        assert_eq!(lexemes.len(), 5);
    }

    #[test]
    fn test_executable_comment_is_sql() {
        let lexemes = words("/*!40101 SET NAMES utf8 */");
        assert_eq!(lexemes[0], Lexeme::Word("SET".into()));
    }

    #[test]
    fn test_statement_split() {
        let scan = scan("SELECT 1; SELECT 2;;").unwrap();
        assert_eq!(scan.statements().len(), 2);
    }

    #[test]
    fn test_unterminated_input() {
        assert!(scan("SELECT 'abc").is_err());
        assert!(scan("SELECT /* abc").is_err());
        assert!(scan("SELECT `abc").is_err());
    }

    #[test]
    fn test_backquoted_identifier() {
        assert_eq!(words("`My``Table`"), vec![Lexeme::Quoted("My`Table".into())]);
    }
}
