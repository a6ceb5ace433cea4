use std::ops::ControlFlow;

use sqlparser::ast::visit_relations;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use super::hint::parse_hints;
use super::lexer::{scan, Lexeme};
use super::{ClassificationError, QueryClassification, QueryType, QueryTypes, StatementClassifier};
use crate::backend::ReplyShape;
use crate::protocol::{Command, Packet};

/// Functions whose result only makes sense on the server that did the write
const MASTER_FUNCTIONS: &[&str] = &[
    "LAST_INSERT_ID",
    "FOUND_ROWS",
    "ROW_COUNT",
    "GET_LOCK",
    "RELEASE_LOCK",
    "RELEASE_ALL_LOCKS",
    "IS_FREE_LOCK",
    "IS_USED_LOCK",
    "MASTER_POS_WAIT",
];

/// Words that end a table reference instead of aliasing it
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "NATURAL", "STRAIGHT_JOIN",
    "ON", "USING", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "FOR", "LOCK", "SET", "VALUES",
    "VALUE", "SELECT", "PARTITION", "WINDOW", "INTO", "USE", "IGNORE", "FORCE", "WITH",
];

/// Classifier for the MySQL text protocol and command bytes.
///
/// Statement kinds come from a lexical scan that understands MySQL comments,
/// quoting and variables; table names additionally come from `sqlparser`
/// whenever the statement parses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlClassifier;

impl SqlClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_sql(&self, sql: &str) -> Result<QueryClassification, ClassificationError> {
        let scanned = scan(sql)?;
        let statements = scanned.statements();
        if statements.is_empty() {
            return Err(ClassificationError::Empty);
        }

        let mut types = QueryTypes::empty();
        let mut tables = Vec::new();
        for statement in &statements {
            types = types.union(statement_types(statement));
            collect_tables(statement, &mut tables);
        }
        if statements.len() > 1 {
            types.insert(QueryType::MultiStatement);
        }

        match Parser::parse_sql(&MySqlDialect {}, sql) {
            Ok(parsed) => {
                for statement in &parsed {
                    let _ = visit_relations(statement, |name| {
                        if let Some(ident) = name.0.last() {
                            push_table(&mut tables, &ident.value);
                        }
                        ControlFlow::<()>::Continue(())
                    });
                }
            }
            Err(e) => debug!(error = %e, "Statement not parsed, using lexical tables only"),
        }

        Ok(QueryClassification {
            tables,
            hints: parse_hints(scanned.comments.iter().map(String::as_str)),
            ..QueryClassification::new(Command::Query, types)
        })
    }
}

impl StatementClassifier for SqlClassifier {
    fn classify(&self, packet: &Packet) -> Result<QueryClassification, ClassificationError> {
        let command = packet.command();
        let body = packet.payload.get(1..).unwrap_or_default();
        let with = |types: &[QueryType], reply: ReplyShape| QueryClassification {
            reply,
            ..QueryClassification::new(command, types.iter().copied().collect())
        };

        let classification = match command {
            Command::Query => self.classify_sql(&String::from_utf8_lossy(body))?,
            Command::InitDb | Command::SetOption | Command::ResetConnection => {
                with(&[QueryType::SessionWrite], ReplyShape::Standard)
            }
            // Statement ids are backend-assigned, so the binary protocol stays on the master
            Command::StmtPrepare => with(&[QueryType::Write], ReplyShape::Prepare),
            Command::StmtFetch => with(&[QueryType::Write], ReplyShape::Fetch),
            Command::StmtClose | Command::StmtSendLongData => with(&[QueryType::Write], ReplyShape::None),
            Command::Ping => with(&[QueryType::Read], ReplyShape::Standard),
            Command::Statistics => with(&[QueryType::Read], ReplyShape::Single),
            Command::FieldList => {
                let mut c = with(&[QueryType::Read], ReplyShape::FieldList);
                let table = body.split(|b| *b == 0).next().unwrap_or_default();
                push_table(&mut c.tables, &String::from_utf8_lossy(table));
                c
            }
            Command::Quit => with(&[], ReplyShape::None),
            Command::Unknown if packet.payload.is_empty() => return Err(ClassificationError::Empty),
            _ => with(&[QueryType::Write], ReplyShape::Standard),
        };

        debug!(command = command.name(), types = %classification.types, "Classified");
        Ok(classification)
    }
}

fn word(lexemes: &[Lexeme], i: usize) -> Option<&str> {
    match lexemes.get(i) {
        Some(Lexeme::Word(w)) => Some(w.as_str()),
        _ => None,
    }
}

fn has_word(lexemes: &[Lexeme], keyword: &str) -> bool {
    lexemes.iter().any(|l| l.is_word(keyword))
}

fn statement_types(lexemes: &[Lexeme]) -> QueryTypes {
    let one = |ty: QueryType| [ty].into_iter().collect::<QueryTypes>();
    let first = match lexemes.first() {
        Some(Lexeme::LParen) => "SELECT",
        Some(Lexeme::Word(w)) => w.as_str(),
        _ => return one(QueryType::Write),
    };

    match first {
        "SELECT" | "VALUES" | "TABLE" => select_types(lexemes),
        "WITH" => {
            if ["INSERT", "UPDATE", "DELETE", "REPLACE"].iter().any(|w| has_word(lexemes, w)) {
                one(QueryType::Write)
            } else {
                select_types(lexemes)
            }
        }
        "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "HELP" => one(QueryType::Read),
        "SET" => set_types(lexemes),
        "USE" | "PREPARE" | "DEALLOCATE" => one(QueryType::SessionWrite),
        "BEGIN" => one(QueryType::BeginTrx),
        "START" if word(lexemes, 1) == Some("TRANSACTION") => one(QueryType::BeginTrx),
        "COMMIT" => one(QueryType::Commit),
        "ROLLBACK" if has_word(lexemes, "TO") => one(QueryType::Write),
        "ROLLBACK" => one(QueryType::Rollback),
        "DROP" => match word(lexemes, 1) {
            Some("PREPARE") => one(QueryType::SessionWrite),
            Some("TABLE") | Some("TEMPORARY") => [QueryType::Write, QueryType::DropTable].into_iter().collect(),
            _ => one(QueryType::Write),
        },
        "CREATE" if word(lexemes, 1) == Some("TEMPORARY") => {
            [QueryType::Write, QueryType::CreateTmpTable].into_iter().collect()
        }
        "LOAD" => {
            let local = lexemes
                .iter()
                .take_while(|l| !l.is_word("INFILE"))
                .any(|l| l.is_word("LOCAL"));
            if local {
                [QueryType::Write, QueryType::LoadData].into_iter().collect()
            } else {
                one(QueryType::Write)
            }
        }
        _ => one(QueryType::Write),
    }
}

fn select_types(lexemes: &[Lexeme]) -> QueryTypes {
    let mut types = QueryTypes::empty();
    types.insert(QueryType::Read);

    for (i, lexeme) in lexemes.iter().enumerate() {
        let next = lexemes.get(i + 1);
        match lexeme {
            Lexeme::UserVar(_) if next == Some(&Lexeme::Assign) => types.insert(QueryType::UserVarWrite),
            Lexeme::UserVar(_) => types.insert(QueryType::UserVarRead),
            Lexeme::SysVar(name) if name.ends_with("identity") || name.ends_with("last_insert_id") => {
                types.insert(QueryType::MasterRead)
            }
            Lexeme::Word(w) => match w.as_str() {
                "INTO" => match next {
                    Some(Lexeme::UserVar(_)) => types.insert(QueryType::UserVarWrite),
                    Some(Lexeme::Word(n)) if n == "OUTFILE" || n == "DUMPFILE" => {
                        types.insert(QueryType::Write)
                    }
                    _ => {}
                },
                "FOR" if matches!(word(lexemes, i + 1), Some("UPDATE") | Some("SHARE")) => {
                    types.insert(QueryType::MasterRead)
                }
                "LOCK" if word(lexemes, i + 1) == Some("IN") && word(lexemes, i + 2) == Some("SHARE") => {
                    types.insert(QueryType::MasterRead)
                }
                f if next == Some(&Lexeme::LParen) && MASTER_FUNCTIONS.contains(&f) => {
                    types.insert(QueryType::MasterRead)
                }
                _ => {}
            },
            _ => {}
        }
    }
    types
}

fn set_types(lexemes: &[Lexeme]) -> QueryTypes {
    let mut types = QueryTypes::empty();
    if matches!(
        word(lexemes, 1),
        Some("GLOBAL") | Some("PERSIST") | Some("PERSIST_ONLY") | Some("PASSWORD")
    ) {
        types.insert(QueryType::Write);
        return types;
    }
    types.insert(QueryType::SessionWrite);

    for (i, lexeme) in lexemes.iter().enumerate() {
        let assigned = matches!(lexemes.get(i + 1), Some(Lexeme::Eq) | Some(Lexeme::Assign));
        match lexeme {
            Lexeme::UserVar(_) if assigned => types.insert(QueryType::UserVarWrite),
            Lexeme::UserVar(_) => types.insert(QueryType::UserVarRead),
            Lexeme::SysVar(name) if name.starts_with("global.") => {
                types.remove(QueryType::SessionWrite);
                types.insert(QueryType::Write);
            }
            _ => {}
        }

        let is_autocommit = match lexeme {
            Lexeme::Word(w) => w == "AUTOCOMMIT",
            Lexeme::SysVar(name) => name == "autocommit" || name.ends_with(".autocommit"),
            _ => false,
        };
        if is_autocommit && assigned {
            let value = match lexemes.get(i + 2) {
                Some(Lexeme::Word(v)) | Some(Lexeme::Number(v)) => v.as_str(),
                _ => "",
            };
            match value {
                "0" | "OFF" | "FALSE" => types.insert(QueryType::DisableAutocommit),
                "1" | "ON" | "TRUE" => types.insert(QueryType::EnableAutocommit),
                _ => {}
            }
        }
    }
    types
}

fn push_table(tables: &mut Vec<String>, name: &str) {
    let name = name.to_lowercase();
    if !name.is_empty() && !tables.contains(&name) {
        tables.push(name);
    }
}

/// Table name at `i`, possibly database-qualified. Returns the name and the
/// index after it.
fn table_ref(lexemes: &[Lexeme], mut i: usize) -> Option<(String, usize)> {
    let mut name = None;
    loop {
        match lexemes.get(i) {
            Some(Lexeme::Word(w)) if name.is_none() && !CLAUSE_WORDS.contains(&w.as_str()) => {
                name = Some(w.clone())
            }
            Some(Lexeme::Quoted(q)) if name.is_none() => name = Some(q.clone()),
            _ => break,
        }
        i += 1;
        if lexemes.get(i) == Some(&Lexeme::Dot) {
            name = None;
            i += 1;
        } else {
            break;
        }
    }
    name.map(|n| (n, i))
}

/// Lexical table extraction, used alongside the parser's view
fn collect_tables(lexemes: &[Lexeme], tables: &mut Vec<String>) {
    let mut i = 0;
    while i < lexemes.len() {
        let introduces_list = match &lexemes[i] {
            Lexeme::Word(w) => match w.as_str() {
                "FROM" | "TABLE" | "TABLES" => true,
                "JOIN" | "INTO" | "TRUNCATE" | "DESCRIBE" | "DESC" => false,
                "UPDATE" if i == 0 => true,
                _ => {
                    i += 1;
                    continue;
                }
            },
            _ => {
                i += 1;
                continue;
            }
        };

        i += 1;
        // IF [NOT] EXISTS
        if lexemes.get(i).map_or(false, |l| l.is_word("IF")) {
            while i < lexemes.len() && !lexemes[i].is_word("EXISTS") {
                i += 1;
            }
            i += 1;
        }
        if matches!(word(lexemes, i), Some("OUTFILE") | Some("DUMPFILE")) {
            continue;
        }

        while let Some((name, next)) = table_ref(lexemes, i) {
            push_table(tables, &name);
            i = next;
            if !introduces_list {
                break;
            }
            // optional alias
            if lexemes.get(i).map_or(false, |l| l.is_word("AS")) {
                i += 2;
            } else if matches!(lexemes.get(i), Some(Lexeme::Word(w)) if !CLAUSE_WORDS.contains(&w.as_str()))
                || matches!(lexemes.get(i), Some(Lexeme::Quoted(_)))
            {
                i += 1;
            }
            if lexemes.get(i) == Some(&Lexeme::Comma) {
                i += 1;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RouteHint;

    fn query(sql: &str) -> QueryClassification {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        SqlClassifier::new().classify(&Packet::new(0, payload)).unwrap()
    }

    #[test]
    fn test_reads_and_writes() {
        assert!(query("SELECT * FROM users WHERE id = 1").is_read());
        assert!(query("  select 1").is_read());
        assert!(query("(SELECT 1) UNION (SELECT 2)").is_read());
        assert!(query("SHOW TABLES").is_read());
        assert!(query("WITH x AS (SELECT 1) SELECT * FROM x").is_read());

        for sql in [
            "INSERT INTO users VALUES (1)",
            "UPDATE users SET name = 'x'",
            "DELETE FROM users",
            "CALL proc()",
            "SELECT * FROM t INTO OUTFILE '/tmp/x'",
            "FROBNICATE everything",
        ] {
            let c = query(sql);
            assert!(c.is(QueryType::Write), "{}", sql);
            assert!(!c.is_read(), "{}", sql);
        }
    }

    #[test]
    fn test_master_reads() {
        for sql in [
            "SELECT LAST_INSERT_ID()",
            "SELECT found_rows()",
            "SELECT * FROM t FOR UPDATE",
            "SELECT * FROM t LOCK IN SHARE MODE",
            "SELECT @@identity",
        ] {
            assert!(query(sql).is(QueryType::MasterRead), "{}", sql);
        }
        assert!(!query("SELECT last_insert_id FROM t").is(QueryType::MasterRead));
    }

    #[test]
    fn test_session_commands() {
        let set = query("SET @a = 1");
        assert!(set.is(QueryType::SessionWrite));
        assert!(set.is(QueryType::UserVarWrite));

        assert!(query("SET NAMES utf8mb4").is(QueryType::SessionWrite));
        assert!(query("USE shop").is(QueryType::SessionWrite));
        assert!(query("PREPARE s FROM 'SELECT 1'").is(QueryType::SessionWrite));
        assert!(query("DEALLOCATE PREPARE s").is(QueryType::SessionWrite));

        let global = query("SET GLOBAL max_connections = 10");
        assert!(global.is(QueryType::Write));
        assert!(!global.is(QueryType::SessionWrite));
    }

    #[test]
    fn test_user_variables_in_select() {
        let read = query("SELECT @a");
        assert!(read.is(QueryType::UserVarRead));
        assert!(read.is_read());

        let write = query("SELECT @a := @a + 1 FROM t");
        assert!(write.is(QueryType::Read));
        assert!(write.is(QueryType::UserVarWrite));
        assert!(!write.is_read());

        assert!(query("SELECT id INTO @x FROM t").is(QueryType::UserVarWrite));
    }

    #[test]
    fn test_transactions_and_autocommit() {
        assert!(query("BEGIN").is(QueryType::BeginTrx));
        assert!(query("START TRANSACTION READ ONLY").is(QueryType::BeginTrx));
        assert!(query("commit").is(QueryType::Commit));
        assert!(query("ROLLBACK").is(QueryType::Rollback));
        assert!(!query("ROLLBACK TO SAVEPOINT s").is(QueryType::Rollback));

        let off = query("SET autocommit = 0");
        assert!(off.is(QueryType::DisableAutocommit));
        assert!(off.is(QueryType::SessionWrite));
        assert!(query("SET @@session.autocommit=ON").is(QueryType::EnableAutocommit));
        assert!(query("set autocommit=1").is(QueryType::EnableAutocommit));
    }

    #[test]
    fn test_temporary_tables() {
        let create = query("CREATE TEMPORARY TABLE tmp_orders (id INT)");
        assert!(create.is(QueryType::CreateTmpTable));
        assert!(create.tables.contains(&"tmp_orders".to_string()));

        let drop = query("DROP TABLE IF EXISTS shop.tmp_orders, `Other`");
        assert!(drop.is(QueryType::DropTable));
        assert!(drop.tables.contains(&"tmp_orders".to_string()));
        assert!(drop.tables.contains(&"other".to_string()));
    }

    #[test]
    fn test_tables_from_joins_and_lists() {
        let c = query("SELECT * FROM a x, db.b AS y JOIN `C` ON x.id = y.id WHERE 1");
        for table in ["a", "b", "c"] {
            assert!(c.tables.contains(&table.to_string()), "{} in {:?}", table, c.tables);
        }
        assert!(!c.tables.contains(&"x".to_string()));
    }

    #[test]
    fn test_multi_statement_and_load_data() {
        let multi = query("SELECT 1; INSERT INTO t VALUES (1);");
        assert!(multi.is(QueryType::MultiStatement));
        assert!(multi.is(QueryType::Write));
        assert!(!query("SELECT 1;").is(QueryType::MultiStatement));

        let load = query("LOAD DATA LOCAL INFILE '/tmp/x.csv' INTO TABLE t");
        assert!(load.is(QueryType::LoadData));
        assert!(!query("LOAD DATA INFILE '/tmp/x.csv' INTO TABLE t").is(QueryType::LoadData));
    }

    #[test]
    fn test_hints_extracted() {
        let c = query("SELECT * FROM t -- maxscale route to server db2");
        assert_eq!(c.hints, vec![RouteHint::ToServer("db2".into())]);
    }

    #[test]
    fn test_errors() {
        let classifier = SqlClassifier::new();
        let packet = |sql: &str| {
            let mut payload = vec![Command::Query as u8];
            payload.extend_from_slice(sql.as_bytes());
            Packet::new(0, payload)
        };
        assert_eq!(classifier.classify(&packet("   ")), Err(ClassificationError::Empty));
        assert_eq!(classifier.classify(&packet("-- nothing")), Err(ClassificationError::Empty));
        assert!(matches!(
            classifier.classify(&packet("SELECT 'oops")),
            Err(ClassificationError::Malformed(_))
        ));
        assert_eq!(classifier.classify(&Packet::new(0, Vec::new())), Err(ClassificationError::Empty));
    }

    #[test]
    fn test_protocol_commands() {
        let classifier = SqlClassifier::new();
        let classify = |bytes: &[u8]| classifier.classify(&Packet::new(0, bytes.to_vec())).unwrap();

        assert!(classify(&[Command::InitDb as u8, b'd', b'b']).is(QueryType::SessionWrite));
        assert!(classify(&[Command::Ping as u8]).is_read());

        let prepare = classify(b"\x16SELECT ?");
        assert!(prepare.is(QueryType::Write));
        assert_eq!(prepare.reply, ReplyShape::Prepare);
        assert_eq!(classify(&[Command::StmtClose as u8, 1, 0, 0, 0]).reply, ReplyShape::None);

        let fields = classify(b"\x04Users\x00");
        assert_eq!(fields.reply, ReplyShape::FieldList);
        assert_eq!(fields.tables, vec!["users".to_string()]);
    }
}
