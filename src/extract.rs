//! Text extraction for ingestable sources.
//!
//! Files are dispatched on extension: PDF via `pdf-extract`, DOCX by pulling
//! `word/document.xml` out of the OOXML ZIP and collecting `<w:t>` runs,
//! plain text and Markdown straight from disk. URLs are fetched and, when
//! the body is HTML, reduced to visible text.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::Path;

/// Maximum decompressed bytes read from a ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Load a document from disk, dispatching on its extension.
pub fn load_path(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| anyhow::anyhow!("PDF extraction failed: {}", e))
        }
        "docx" => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            extract_docx(&bytes)
        }
        "txt" | "md" | "markdown" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        other => bail!("Document type '{}' not supported.", other),
    }
}

/// Fetch a URL and return its visible text.
pub async fn fetch_url(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .header("User-Agent", "sql-copilot")
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!("Fetching {} failed with status {}", url, status);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = response.text().await?;

    if content_type.contains("text/html") || body.trim_start().starts_with("<!") {
        Ok(strip_html(&body))
    } else {
        Ok(body)
    }
}

/// Extract the document text from a DOCX file: the `<w:t>` runs of
/// `word/document.xml`, with a newline per paragraph.
pub fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| anyhow::anyhow!("Not a DOCX archive: {}", e))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| anyhow::anyhow!("word/document.xml not found in archive"))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| anyhow::anyhow!("Failed to read document.xml: {}", e))?;
    }
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        bail!("word/document.xml exceeds size limit");
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => bail!("DOCX parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}

/// Reduce an HTML page to its visible text: tags removed, `<script>` and
/// `<style>` bodies dropped, common entities decoded, whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut rest = html;

    loop {
        match rest.find('<') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(lt) => {
                out.push_str(&rest[..lt]);
                let after = &rest[lt + 1..];
                let Some(gt) = after.find('>') else {
                    break;
                };
                let tag = &after[..gt];
                rest = &after[gt + 1..];

                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
                    .next()
                    .unwrap_or("")
                    .to_lowercase();

                if !tag.starts_with('/') && (name == "script" || name == "style") {
                    let close = format!("</{}", name);
                    match find_ascii_ci(rest, &close) {
                        Some(pos) => {
                            let after_close = &rest[pos..];
                            match after_close.find('>') {
                                Some(g) => rest = &after_close[g + 1..],
                                None => break,
                            }
                        }
                        None => break,
                    }
                } else if matches!(
                    name.as_str(),
                    "p" | "br" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
                ) {
                    out.push('\n');
                }
            }
        }
    }

    collapse_whitespace(&decode_entities(&out))
}

/// ASCII case-insensitive substring search. The needle must be ASCII; a
/// match therefore always lands on a char boundary.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(s: &str) -> String {
    s.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
