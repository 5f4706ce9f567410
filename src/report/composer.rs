//! Markdown answer composition.
//!
//! This module turns the final specialist result, the routing decision and
//! an optional chart into the markdown returned to the user.

use crate::models::{GraphArtifact, Row, RoutingDecision, SpecialistResult};
use serde_json::Value;

/// Rows rendered before the table is cut off.
pub const MAX_TABLE_ROWS: usize = 10;

const SPANISH_HINTS: &[&str] = &[
    "el", "la", "los", "las", "del", "por", "para", "cual", "cuál", "que", "qué", "cuantas",
    "cuántas", "cuantos", "cuántos", "mes", "año", "ingresos", "noches", "muestra", "dame",
    "reservas", "mayorista", "gráfico",
];

/// Compose the final markdown.
///
/// A clarifying question from routing or from a specialist replaces
/// everything else.
pub fn compose_markdown(
    decision: &RoutingDecision,
    result: &SpecialistResult,
    graph: Option<&GraphArtifact>,
    last_user: &str,
) -> String {
    if let Some(question) = decision.clarifying().or_else(|| result.clarifying()) {
        return question.to_string();
    }

    let mut output = String::new();

    output.push_str(&format!("# {}\n\n", decision.user_question.trim()));
    let goal = decision.user_goal.trim();
    if !goal.is_empty() && goal != decision.user_question.trim() {
        output.push_str(&format!("_{}_\n\n", goal));
    }

    if let Some(table) = render_table(result.rows()) {
        output.push_str(&table);
        output.push('\n');
    }

    if let Some(artifact) = graph {
        output.push_str(&format!("![Chart]({})\n\n", artifact.image_reference));
    }

    output.push_str(&render_findings(&result.findings));
    output.push_str(closing_line(last_user));
    output.push('\n');

    output
}

/// Markdown table for at least 2 rows and 2 columns, else `None`.
pub fn render_table(rows: &[Row]) -> Option<String> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    if rows.len() < 2 || columns.len() < 2 {
        return None;
    }

    let mut table = String::new();
    table.push_str(&format!(
        "| {} |\n",
        columns.iter().map(|c| escape_cell(c)).collect::<Vec<_>>().join(" | ")
    ));
    table.push_str(&format!(
        "|{}|\n",
        columns.iter().map(|_| "---").collect::<Vec<_>>().join("|")
    ));

    for row in rows.iter().take(MAX_TABLE_ROWS) {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(format_cell).unwrap_or_default())
            .collect();
        table.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    if rows.len() > MAX_TABLE_ROWS {
        table.push_str(&format!(
            "\n_… (truncated, showing {} of {} rows)_\n",
            MAX_TABLE_ROWS,
            rows.len()
        ));
    }

    Some(table)
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape_cell(s),
        other => escape_cell(&other.to_string()),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn render_findings(findings: &str) -> String {
    let text = findings.trim();
    if text.is_empty() {
        return String::new();
    }

    let lowered = text.to_ascii_lowercase();
    let insights = lowered.find("insights:");
    let recommendations = lowered.find("recommendations:");

    let mut section = String::new();
    match (insights, recommendations) {
        (None, None) => push_section(&mut section, "Details", text),
        (i, r) => {
            let first = i.into_iter().chain(r).min().unwrap_or(0);
            push_section(&mut section, "Details", &text[..first]);

            let mut marks: Vec<(usize, &str, usize)> = Vec::new();
            if let Some(i) = i {
                marks.push((i, "Insights", "insights:".len()));
            }
            if let Some(r) = r {
                marks.push((r, "Recommendations", "recommendations:".len()));
            }
            marks.sort();

            for (n, (start, title, len)) in marks.iter().enumerate() {
                let end = marks.get(n + 1).map(|m| m.0).unwrap_or(text.len());
                push_section(&mut section, title, &text[start + len..end]);
            }
        }
    }

    section
}

fn push_section(out: &mut String, title: &str, body: &str) {
    let body = body
        .trim()
        .trim_start_matches('*')
        .trim_end_matches(['*', '#'])
        .trim();
    if body.is_empty() {
        return;
    }
    out.push_str(&format!("## {}\n\n{}\n\n", title, body));
}

/// Closing sentence in the language of the last user turn.
pub fn closing_line(last_user: &str) -> &'static str {
    if looks_spanish(last_user) {
        "¿Quieres que profundice en alguno de estos resultados?"
    } else {
        "Let me know if you would like to dig deeper into any of these results."
    }
}

fn looks_spanish(text: &str) -> bool {
    if text.contains(['¿', '¡', 'ñ', 'Ñ']) {
        return true;
    }

    let lowered = text.to_lowercase();
    let hits = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| SPANISH_HINTS.contains(w))
        .count();
    hits >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decision(question: &str) -> RoutingDecision {
        RoutingDecision {
            assigned_specialists: Vec::new(),
            user_question: question.to_string(),
            user_goal: "Monthly nights".to_string(),
            commentary: String::new(),
            requires_graph: false,
            clarifying_question: None,
        }
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                serde_json::from_value(json!({"month": format!("M{:02}", i + 1), "nights": i * 3}))
                    .unwrap()
            })
            .collect()
    }

    fn result(data: Vec<Row>, findings: &str) -> SpecialistResult {
        SpecialistResult {
            data: Some(data),
            findings: findings.to_string(),
            clarifying_question: None,
        }
    }

    #[test]
    fn test_clarification_renders_only_the_question() {
        let mut d = decision("Revenue?");
        d.clarifying_question = Some("For which year?".to_string());
        let md = compose_markdown(&d, &result(rows(5), "lots"), None, "Revenue?");
        assert_eq!(md, "For which year?");

        let mut specialist = result(rows(5), "lots");
        specialist.clarifying_question = Some("Which hotel?".to_string());
        let md = compose_markdown(&decision("Revenue?"), &specialist, None, "Revenue?");
        assert_eq!(md, "Which hotel?");
    }

    #[test]
    fn test_table_truncates_at_exactly_ten_rows() {
        let ten = render_table(&rows(10)).unwrap();
        assert!(!ten.contains("truncated"));
        assert_eq!(ten.lines().filter(|l| l.starts_with("| M")).count(), 10);

        let eleven = render_table(&rows(11)).unwrap();
        assert!(eleven.contains("_… (truncated, showing 10 of 11 rows)_"));
        assert_eq!(eleven.lines().filter(|l| l.starts_with("| M")).count(), 10);
    }

    #[test]
    fn test_no_table_for_tiny_results() {
        assert!(render_table(&rows(1)).is_none());

        let single_column: Vec<Row> = (0..4)
            .map(|i| serde_json::from_value(json!({"total": i})).unwrap())
            .collect();
        assert!(render_table(&single_column).is_none());
    }

    #[test]
    fn test_cells_are_escaped() {
        let data: Vec<Row> = serde_json::from_value(json!([
            {"name": "A|B", "value": null},
            {"name": "line\nbreak", "value": 2.5}
        ]))
        .unwrap();
        let table = render_table(&data).unwrap();
        assert!(table.contains("| A\\|B |  |"));
        assert!(table.contains("| line break | 2.5 |"));
    }

    #[test]
    fn test_chart_follows_table() {
        let artifact = GraphArtifact {
            generation_code: "plt.savefig(img_buf)".to_string(),
            image_reference: "https://files.example.com/c.png".to_string(),
        };
        let md = compose_markdown(
            &decision("Show a bar chart of nights booked per month"),
            &result(rows(3), "March peaks."),
            Some(&artifact),
            "Show a bar chart of nights booked per month",
        );

        let table_end = md.find("| M03 | 6 |").unwrap();
        let chart = md.find("![Chart](https://files.example.com/c.png)").unwrap();
        let details = md.find("## Details").unwrap();
        assert!(table_end < chart && chart < details);
        assert!(md.starts_with("# Show a bar chart of nights booked per month\n\n_Monthly nights_"));
    }

    #[test]
    fn test_insights_and_recommendations_split() {
        let md = render_findings(
            "**Insights:** Villas drive revenue.\n\n**Recommendations:** Raise villa rates in July.",
        );
        assert_eq!(
            md,
            "## Insights\n\nVillas drive revenue.\n\n## Recommendations\n\nRaise villa rates in July.\n\n"
        );
        assert_eq!(render_findings("Plain text."), "## Details\n\nPlain text.\n\n");
    }

    #[test]
    fn test_closing_language() {
        assert!(closing_line("¿Cuántas noches hubo en marzo?").starts_with('¿'));
        assert!(closing_line("dame los ingresos por mes").starts_with('¿'));
        assert!(closing_line("What is total revenue by room category in 2025?").starts_with("Let me"));
    }
}
