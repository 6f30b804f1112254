/// Split a message into chunks of at most `max_len` characters.
///
/// Splits on newline boundaries when possible, falling back to hard splits
/// if a single line exceeds the limit. Lengths are counted in chars so
/// multi-byte text never splits inside a code point.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len || max_len == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if needed <= max_len {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len = needed;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current_len = 0;

        if line_len > max_len {
            let chars: Vec<char> = line.chars().collect();
            let mut pieces = chars.chunks(max_len).peekable();
            while let Some(piece) = pieces.next() {
                if pieces.peek().is_some() {
                    chunks.push(piece.iter().collect());
                } else {
                    current = piece.iter().collect();
                    current_len = piece.len();
                }
            }
        } else {
            current = line.to_string();
            current_len = line_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
