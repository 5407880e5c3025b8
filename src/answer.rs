//! The ask pipeline: question → SQL → execution → narration, with a
//! conversational fallback.
//!
//! A linear state machine with fallback edges. Any failure between SQL
//! generation and execution degrades to a schema-grounded conversational
//! answer; the user-visible text is indistinguishable from a direct answer,
//! but the returned [`DbAnswer`] and the tracing records keep the two paths
//! apart for tests and server-side diagnostics. A model failure on the
//! fallback path itself is not caught and propagates to the caller.

use anyhow::Result;

use crate::llm::ChatModel;
use crate::mssql::QueryExecutor;
use crate::prompts;
use crate::schema::SchemaSummary;
use crate::session::ChatMessage;

pub const NO_DATABASE_MSG: &str =
    "There is no database loaded. Please upload a .bak backup file first.";
pub const EMPTY_SCHEMA_MSG: &str =
    "The database is empty or has no user tables. Check the .bak file.";
pub const NO_QUESTION_MSG: &str = "Could not determine the user's question.";

/// Why the pipeline degraded to the conversational path. Logged, never shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    GenerationError(String),
    EmptySql,
    ExecutionError(String),
}

/// Terminal outcome of one ask turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbAnswer {
    /// The SQL path succeeded and the text narrates real query results.
    Answered(String),
    /// The SQL path failed somewhere; the text is a conversational answer
    /// grounded only in the schema.
    FellBack {
        text: String,
        reason: FallbackReason,
    },
    /// Precondition failure; fixed message, no model or database call made.
    Unavailable(&'static str),
}

impl DbAnswer {
    /// The text shown to the user; identical in shape across variants.
    pub fn text(&self) -> &str {
        match self {
            DbAnswer::Answered(text) => text,
            DbAnswer::FellBack { text, .. } => text,
            DbAnswer::Unavailable(text) => text,
        }
    }
}

/// Answer the latest question in `history` against the current database.
///
/// `history` is the full conversation including the latest user message;
/// only the latest message is shown to the SQL-generation call, while the
/// fallback path sees everything. The caller owns appending the returned
/// answer to the session history.
pub async fn answer_db_question(
    model: &dyn ChatModel,
    executor: &dyn QueryExecutor,
    current_db: Option<&str>,
    schema: &SchemaSummary,
    history: &[ChatMessage],
    max_result_rows: usize,
) -> Result<DbAnswer> {
    let Some(database) = current_db else {
        return Ok(DbAnswer::Unavailable(NO_DATABASE_MSG));
    };

    let Some(schema_text) = schema.tables() else {
        return Ok(DbAnswer::Unavailable(EMPTY_SCHEMA_MSG));
    };

    let question = match history.last() {
        Some(msg) if !msg.content.trim().is_empty() => msg.content.clone(),
        _ => return Ok(DbAnswer::Unavailable(NO_QUESTION_MSG)),
    };

    // Generate: schema + the latest question only.
    let generate_messages = vec![
        ChatMessage::system(prompts::generate_sql_system(schema_text)),
        ChatMessage::user(question.clone()),
    ];
    let raw = match model.complete(&generate_messages).await {
        Ok(raw) => raw,
        Err(e) => {
            return fall_back(
                model,
                schema_text,
                history,
                FallbackReason::GenerationError(e.to_string()),
            )
            .await;
        }
    };

    let Some(sql) = extract_sql(&raw) else {
        return fall_back(model, schema_text, history, FallbackReason::EmptySql).await;
    };

    let output = match executor.run(database, &sql).await {
        Ok(output) => output,
        Err(e) => {
            return fall_back(
                model,
                schema_text,
                history,
                FallbackReason::ExecutionError(e.to_string()),
            )
            .await;
        }
    };

    // Explain: cap the row sample, keep the true total.
    let total_rows = output.rows.len();
    let sample: Vec<_> = output.rows.iter().take(max_result_rows).collect();
    let payload = serde_json::json!({
        "question": question,
        "sql": sql,
        "columns": output.columns,
        "rows_sample": sample,
        "total_rows": total_rows,
    });

    let explain_messages = vec![
        ChatMessage::system(prompts::explain_system()),
        ChatMessage::system(prompts::explain_context(&payload)),
    ];
    let narration = model.complete(&explain_messages).await?;

    Ok(DbAnswer::Answered(narration))
}

/// The conversational path: schema as context, full history, no SQL mandate.
/// A model error here propagates unhandled.
async fn fall_back(
    model: &dyn ChatModel,
    schema_text: &str,
    history: &[ChatMessage],
    reason: FallbackReason,
) -> Result<DbAnswer> {
    tracing::warn!(?reason, "SQL path failed, degrading to conversational answer");

    let mut messages = vec![ChatMessage::system(prompts::fallback_system(schema_text))];
    messages.extend_from_slice(history);

    let text = model.complete(&messages).await?;
    Ok(DbAnswer::FellBack { text, reason })
}

/// Pull the SQL statement out of the model's response.
///
/// With a fenced block, the statement is the text between the first and last
/// triple-backtick markers; otherwise the whole trimmed response. A leading
/// bare language tag line (`sql`, `tsql`) is dropped. Returns `None` when
/// nothing usable remains.
pub fn extract_sql(raw: &str) -> Option<String> {
    let body = match raw.find("```") {
        Some(first) => {
            let start = first + 3;
            let last = raw.rfind("```").unwrap_or(first);
            if last > start {
                &raw[start..last]
            } else {
                ""
            }
        }
        None => raw,
    };

    let trimmed = body.trim();
    let without_tag = match trimmed.lines().next() {
        Some(first_line) if matches!(first_line.trim().to_lowercase().as_str(), "sql" | "tsql") => {
            trimmed[first_line.len()..].trim_start()
        }
        _ => trimmed,
    };

    let cleaned = without_tag.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mssql::QueryOutput;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // ── extract_sql ─────────────────────────────────────────────────────

    #[test]
    fn extracts_fenced_block_with_language_tag() {
        let raw = "```sql\nSELECT COUNT(*) FROM dbo.Orders\n```";
        assert_eq!(
            extract_sql(raw).as_deref(),
            Some("SELECT COUNT(*) FROM dbo.Orders")
        );
    }

    #[test]
    fn extracts_between_first_and_last_fence() {
        let raw = "Here you go:\n```\nSELECT 1\n```\nEnjoy!";
        assert_eq!(extract_sql(raw).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn uppercase_tsql_tag_dropped() {
        let raw = "```TSQL\nSELECT TOP 5 * FROM dbo.Products\n```";
        assert_eq!(
            extract_sql(raw).as_deref(),
            Some("SELECT TOP 5 * FROM dbo.Products")
        );
    }

    #[test]
    fn no_fence_uses_whole_trimmed_output() {
        assert_eq!(
            extract_sql("  SELECT 2  \n").as_deref(),
            Some("SELECT 2")
        );
    }

    #[test]
    fn empty_and_tag_only_yield_none() {
        assert_eq!(extract_sql(""), None);
        assert_eq!(extract_sql("   "), None);
        assert_eq!(extract_sql("``````"), None);
        assert_eq!(extract_sql("```sql\n```"), None);
        // unterminated fence has no extractable block
        assert_eq!(extract_sql("```sql SELECT 1"), None);
    }

    // ── pipeline with mocks ─────────────────────────────────────────────

    struct MockModel {
        responses: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl MockModel {
        fn new(responses: Vec<Result<String, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call(&self, n: usize) -> Vec<ChatMessage> {
            self.calls.lock().unwrap()[n].clone()
        }
    }

    #[async_trait]
    impl ChatModel for MockModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.calls.lock().unwrap().push(messages.to_vec());
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(e)) => bail!(e),
                None => bail!("MockModel ran out of responses"),
            }
        }
    }

    struct MockExecutor {
        result: Result<QueryOutput, String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockExecutor {
        fn ok(output: QueryOutput) -> Self {
            Self {
                result: Ok(output),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn err(message: &str) -> Self {
            Self {
                result: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueryExecutor for MockExecutor {
        async fn run(&self, _database: &str, sql: &str) -> Result<QueryOutput> {
            self.calls.lock().unwrap().push(sql.to_string());
            match &self.result {
                Ok(output) => Ok(output.clone()),
                Err(e) => bail!(e.clone()),
            }
        }
    }

    fn schema() -> SchemaSummary {
        SchemaSummary::Tables("TABLE dbo.Orders: OrderID int, CustomerID int".to_string())
    }

    fn history() -> Vec<ChatMessage> {
        vec![ChatMessage::user("How many orders are there?")]
    }

    #[tokio::test]
    async fn no_database_is_terminal_without_any_call() {
        let model = MockModel::new(vec![]);
        let executor = MockExecutor::ok(QueryOutput::default());

        let answer = answer_db_question(&model, &executor, None, &schema(), &history(), 50)
            .await
            .unwrap();

        assert_eq!(answer, DbAnswer::Unavailable(NO_DATABASE_MSG));
        assert_eq!(answer.text(), NO_DATABASE_MSG);
        assert_eq!(model.call_count(), 0);
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_schema_is_terminal_without_model_call() {
        let model = MockModel::new(vec![]);
        let executor = MockExecutor::ok(QueryOutput::default());

        let answer = answer_db_question(
            &model,
            &executor,
            Some("userdb_1"),
            &SchemaSummary::NoTables,
            &history(),
            50,
        )
        .await
        .unwrap();

        assert_eq!(answer, DbAnswer::Unavailable(EMPTY_SCHEMA_MSG));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn generation_error_falls_back_with_full_history() {
        let model = MockModel::new(vec![
            Err("model unavailable".to_string()),
            Ok("Orders are stored in dbo.Orders.".to_string()),
        ]);
        let executor = MockExecutor::ok(QueryOutput::default());

        let answer = answer_db_question(
            &model,
            &executor,
            Some("userdb_1"),
            &schema(),
            &history(),
            50,
        )
        .await
        .unwrap();

        match answer {
            DbAnswer::FellBack { text, reason } => {
                assert_eq!(text, "Orders are stored in dbo.Orders.");
                assert!(matches!(reason, FallbackReason::GenerationError(_)));
            }
            other => panic!("expected fallback, got {:?}", other),
        }
        assert_eq!(executor.call_count(), 0);

        // Fallback call: system prompt with schema + the full history
        let fallback_call = model.call(1);
        assert_eq!(fallback_call.len(), 2);
        assert!(fallback_call[0].content.contains("TABLE dbo.Orders"));
        assert_eq!(fallback_call[1].content, "How many orders are there?");
    }

    #[tokio::test]
    async fn empty_extraction_falls_back_without_executing() {
        let model = MockModel::new(vec![
            Ok("``````".to_string()),
            Ok("I could not produce a query for that.".to_string()),
        ]);
        let executor = MockExecutor::ok(QueryOutput::default());

        let answer = answer_db_question(
            &model,
            &executor,
            Some("userdb_1"),
            &schema(),
            &history(),
            50,
        )
        .await
        .unwrap();

        assert!(matches!(
            answer,
            DbAnswer::FellBack {
                reason: FallbackReason::EmptySql,
                ..
            }
        ));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn execution_error_falls_back() {
        let model = MockModel::new(vec![
            Ok("```sql\nSELECT bogus FROM nowhere\n```".to_string()),
            Ok("That data is not in the schema.".to_string()),
        ]);
        let executor = MockExecutor::err("Invalid object name 'nowhere'");

        let answer = answer_db_question(
            &model,
            &executor,
            Some("userdb_1"),
            &schema(),
            &history(),
            50,
        )
        .await
        .unwrap();

        match answer {
            DbAnswer::FellBack { reason, .. } => {
                assert!(matches!(reason, FallbackReason::ExecutionError(ref e)
                    if e.contains("Invalid object name")));
            }
            other => panic!("expected fallback, got {:?}", other),
        }
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn success_path_caps_row_sample_and_keeps_total() {
        let rows: Vec<Vec<serde_json::Value>> =
            (0..60).map(|i| vec![serde_json::json!(i)]).collect();
        let model = MockModel::new(vec![
            Ok("```sql\nSELECT OrderID FROM dbo.Orders\n```".to_string()),
            Ok("There are 60 orders.".to_string()),
        ]);
        let executor = MockExecutor::ok(QueryOutput {
            columns: vec!["OrderID".to_string()],
            rows,
        });

        let answer = answer_db_question(
            &model,
            &executor,
            Some("userdb_1"),
            &schema(),
            &history(),
            50,
        )
        .await
        .unwrap();

        assert_eq!(answer, DbAnswer::Answered("There are 60 orders.".to_string()));

        // Second model call carries the execution payload
        let explain_call = model.call(1);
        let payload_msg = &explain_call[1].content;
        let json_start = payload_msg.find('{').unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(&payload_msg[json_start..]).unwrap();
        assert_eq!(payload["total_rows"], 60);
        assert_eq!(payload["rows_sample"].as_array().unwrap().len(), 50);
        assert_eq!(payload["columns"][0], "OrderID");
        assert_eq!(payload["sql"], "SELECT OrderID FROM dbo.Orders");
    }

    #[tokio::test]
    async fn fallback_model_error_propagates() {
        let model = MockModel::new(vec![
            Err("generation down".to_string()),
            Err("fallback down too".to_string()),
        ]);
        let executor = MockExecutor::ok(QueryOutput::default());

        let result = answer_db_question(
            &model,
            &executor,
            Some("userdb_1"),
            &schema(),
            &history(),
            50,
        )
        .await;

        assert!(result.is_err());
    }
}
