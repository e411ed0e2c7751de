//! Plain-text rendering: aligned tables and vertical bar plots.

use tanker::Value;

/// Render rows as a space-aligned ascii table.
pub fn ascii_table(rows: &[Vec<String>], headers: Option<&[String]>) -> String {
    let mut widths: Vec<usize> = headers
        .map(|h| h.iter().map(String::len).collect())
        .unwrap_or_else(|| rows.first().map(|r| r.iter().map(String::len).collect()).unwrap_or_default());
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i >= widths.len() {
                widths.push(cell.len());
            } else if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let fmt = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{cell:<w$}"))
            .collect::<Vec<_>>()
            .join(" ")
            + "\n"
    };

    let mut out = String::new();
    if let Some(headers) = headers {
        out.push_str(&fmt(headers));
        let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&fmt(&dashes));
    }
    for row in rows {
        out.push_str(&fmt(row));
    }
    out
}

/// Render rows as a vertical bar plot; the last column must be numeric.
pub fn vbar(rows: &[Vec<Value>], plot_width: usize, tic: Option<&str>) -> Option<String> {
    let tic = tic.unwrap_or("•");
    if rows.is_empty() {
        return Some(String::new());
    }
    let values: Vec<f64> = rows
        .iter()
        .map(|row| match row.last() {
            Some(Value::Int(i)) => Some(*i as f64),
            Some(Value::Float(f)) => Some(*f),
            _ => None,
        })
        .collect::<Option<_>>()?;

    let labels: Vec<String> = rows
        .iter()
        .map(|row| {
            row[..row.len() - 1]
                .iter()
                .map(render_value)
                .collect::<Vec<_>>()
                .join(" / ")
        })
        .collect();
    let label_len = labels.iter().map(String::len).max().unwrap_or(0);
    let value_max = values.iter().cloned().fold(0.0f64, f64::max);
    let value_min = values.iter().cloned().fold(0.0f64, f64::min);
    let value_width = format!(" {value_min:.2}").len().max(format!("{value_max:.2}").len());
    let delta = match value_max - value_min {
        d if d == 0.0 => 1.0,
        d => d,
    };
    let scale = delta / plot_width as f64;
    let left_pane = if value_min < 0.0 {
        (-value_min / scale).round() as usize
    } else {
        0
    };

    let mut out = String::new();
    for (label, value) in labels.iter().zip(&values) {
        out.push_str(&format!("{label:<label_len$} {value:>value_width$.2} "));
        if *value < 0.0 {
            let nb_tics = (-value / scale).round() as usize;
            out.push_str(&" ".repeat(left_pane.saturating_sub(nb_tics)));
            out.push_str(&tic.repeat(nb_tics));
            out.push_str("|\n");
        } else {
            let pos = (value / scale).round() as usize;
            out.push_str(&" ".repeat(left_pane));
            out.push('|');
            out.push_str(&tic.repeat(pos));
            out.push('\n');
        }
    }
    Some(out)
}

/// One cell of output; NULL prints empty.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Str(s) => s.clone(),
        Value::Json(j) => j.to_string(),
        other => {
            // Re-use the JSON rendering for scalars, stripping quotes.
            match other.to_json() {
                serde_json::Value::String(s) => s,
                j => j.to_string(),
            }
        }
    }
}
