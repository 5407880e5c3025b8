//! System-instruction templates for the three database-assistant model
//! calls (generate SQL, explain result, conversational fallback) and the
//! retrieval-augmented chat. Each template embeds the live schema or
//! retrieved context; the strings are the full output contract for the
//! model, so changes here change behavior.

/// Instruction for the SQL-generation call. The entire response must be one
/// T-SQL statement inside a single fenced code block.
pub fn generate_sql_system(schema_text: &str) -> String {
    format!(
        "You are an assistant that generates ONLY T-SQL queries for Microsoft SQL Server.\n\n\
         The database engine is SQL Server. Use standard T-SQL.\n\n\
         You will receive the user's last question and the database schema.\n\
         Your task:\n\
         - Understand the question.\n\
         - Generate EXACTLY ONE T-SQL query that answers it.\n\
         - Return the query inside a single fenced code block.\n\
         - Do NOT write explanations or any other text outside the code block.\n\n\
         Here is the database schema:\n\n\
         {}\n\n\
         Return ONLY the SQL query.",
        schema_text
    )
}

/// Instruction for narrating an executed query's result.
pub fn explain_system() -> &'static str {
    "You are an assistant that answers questions about a Microsoft SQL Server database.\n\n\
     You will be given:\n\
     - the original user question,\n\
     - the T-SQL query that was executed,\n\
     - the query result (column names and rows, possibly truncated),\n\
     - the total number of rows.\n\n\
     Your job is to:\n\
     - Explain the answer in a friendly, concise way, in the user's language.\n\
     - Use the actual query results to answer (do NOT hallucinate values).\n\
     - If the result is a single value (1 row, 1 column), highlight that value.\n\
     - Optionally, show a small Markdown table if there are multiple rows.\n\
     - You may optionally show the SQL query at the end in a code block."
}

/// Second system message for the explain call: the execution context payload.
pub fn explain_context(payload: &serde_json::Value) -> String {
    format!("Execution context (JSON):\n\n{}", payload)
}

/// Instruction for the conversational fallback: answer from the schema as
/// context, without being required to produce SQL.
pub fn fallback_system(schema_text: &str) -> String {
    format!(
        "You are an AI assistant that answers questions about a Microsoft SQL Server database.\n\n\
         You have access to the database schema (tables and columns) below.\n\
         Use it as context, but you do NOT need to always write SQL.\n\
         You can answer conceptually, explain relationships, suggest queries, etc.\n\n\
         Database schema:\n\n\
         {}\n\n\
         Answer the user's question in a clear and friendly way, in the user's language.",
        schema_text
    )
}

/// Instruction for retrieval-augmented chat over ingested documents.
pub fn rag_system(context: &str) -> String {
    format!(
        "You are a helpful assistant. You will have to answer user's queries.\n\
         You will have some context to help with your answers, but it will not always \
         be perfectly relevant.\n\
         You can also use your own knowledge to assist the user.\n\n\
         {}",
        context
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_prompt_embeds_schema() {
        let prompt = generate_sql_system("TABLE dbo.Orders: OrderID int");
        assert!(prompt.contains("TABLE dbo.Orders: OrderID int"));
        assert!(prompt.contains("EXACTLY ONE T-SQL query"));
        assert!(prompt.contains("fenced code block"));
    }

    #[test]
    fn fallback_prompt_does_not_mandate_sql() {
        let prompt = fallback_system("TABLE dbo.Orders: OrderID int");
        assert!(prompt.contains("do NOT need to always write SQL"));
    }

    #[test]
    fn explain_context_carries_payload() {
        let payload = serde_json::json!({"total_rows": 3});
        assert!(explain_context(&payload).contains("\"total_rows\":3"));
    }
}
