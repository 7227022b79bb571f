use btb_core::campaign::MAX_TEXT_LEN;

/// Leave headroom below Telegram's hard limit.
pub(crate) const SAFE_LIMIT: usize = MAX_TEXT_LEN - 96;

/// Split HTML into messages of at most `limit` characters, cutting only between
/// lines so tags opened on a line stay balanced. A single overlong line is cut
/// by characters.
pub(crate) fn split_lines(html: &str, limit: usize) -> Vec<String> {
    if html.chars().count() <= limit {
        return vec![html.to_string()];
    }

    let mut out = Vec::new();
    let mut chunk = String::new();
    let mut chunk_len = 0usize;

    for line in html.split('\n') {
        let line_len = line.chars().count();
        let needed = if chunk.is_empty() { line_len } else { line_len + 1 };

        if chunk_len + needed > limit && !chunk.is_empty() {
            out.push(std::mem::take(&mut chunk));
            chunk_len = 0;
        }

        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                out.push(piece.iter().collect());
            }
            continue;
        }

        if !chunk.is_empty() {
            chunk.push('\n');
            chunk_len += 1;
        }
        chunk.push_str(line);
        chunk_len += line_len;
    }

    if !chunk.trim().is_empty() {
        out.push(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_short_html_intact() {
        let html = "📨 <b>#1</b> x\n⏰ <b>#2</b> y";
        assert_eq!(split_lines(html, 4000), vec![html.to_string()]);
    }

    #[test]
    fn cuts_between_lines() {
        let line = "<b>0123456789</b>";
        let html = vec![line; 10].join("\n");
        let chunks = split_lines(&html, 40);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 40);
            assert_eq!(c.matches("<b>").count(), c.matches("</b>").count());
        }
        assert_eq!(chunks.join("\n"), html);
    }

    #[test]
    fn overlong_line_is_cut_by_chars() {
        let html = "я".repeat(25);
        let chunks = split_lines(&html, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].chars().count(), 5);
    }
}
