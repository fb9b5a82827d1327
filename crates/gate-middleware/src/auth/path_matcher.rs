//! Ant 风格路径匹配
//!
//! - `?` 匹配一个字符（不含 `/`）
//! - `*` 匹配段内任意字符
//! - `**` 匹配零个或多个完整路径段
//! - `{name}` 匹配段内任意字符（路径变量）

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// 判断 `path` 是否匹配 `pattern`
pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern_segments = segments(pattern);
    let path_segments = segments(path);
    match_segments(&pattern_segments, &path_segments)
}

/// 自底向上的表：`table[i][j]` 表示 `pattern[i..]` 能否匹配 `path[j..]`
///
/// 每个 (模式段, 路径段) 只计算一次，多个 `**` 也不会指数回溯。
fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    let width = path.len() + 1;
    let mut table = vec![false; (pattern.len() + 1) * width];
    table[pattern.len() * width + path.len()] = true;

    for i in (0..pattern.len()).rev() {
        for j in (0..=path.len()).rev() {
            table[i * width + j] = if pattern[i] == "**" {
                // 跳过 ** 或让它多吞一段
                table[(i + 1) * width + j] || (j < path.len() && table[i * width + j + 1])
            } else {
                j < path.len() && table[(i + 1) * width + j + 1] && match_segment(pattern[i], path[j])
            };
        }
    }
    table[0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '?' => tokens.push(Token::AnyChar),
            '*' => {
                if tokens.last() != Some(&Token::AnyRun) {
                    tokens.push(Token::AnyRun);
                }
            }
            '{' => {
                // 未闭合的 `{` 按字面量处理
                let rest: String = chars.clone().collect();
                match rest.chars().position(|c| c == '}') {
                    Some(end) => {
                        for _ in 0..=end {
                            chars.next();
                        }
                        if tokens.last() != Some(&Token::AnyRun) {
                            tokens.push(Token::AnyRun);
                        }
                    }
                    None => tokens.push(Token::Literal('{')),
                }
            }
            other => tokens.push(Token::Literal(other)),
        }
    }
    tokens
}

/// 单段内的通配匹配（贪心回溯）
fn match_segment(pattern: &str, segment: &str) -> bool {
    if !pattern.contains(|c: char| matches!(c, '*' | '?' | '{')) {
        return pattern == segment;
    }

    let tokens = tokenize(pattern);
    let text: Vec<char> = segment.chars().collect();

    let (mut t, mut s) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while s < text.len() {
        match tokens.get(t) {
            Some(Token::Literal(c)) if *c == text[s] => {
                t += 1;
                s += 1;
            }
            Some(Token::AnyChar) => {
                t += 1;
                s += 1;
            }
            Some(Token::AnyRun) => {
                star = Some((t, s));
                t += 1;
            }
            _ => match star {
                Some((star_t, star_s)) => {
                    t = star_t + 1;
                    s = star_s + 1;
                    star = Some((star_t, star_s + 1));
                }
                None => return false,
            },
        }
    }

    tokens[t..].iter().all(|token| *token == Token::AnyRun)
}
