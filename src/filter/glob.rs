/// Filename-style wildcard pattern for entity ids.
///
/// - `*` matches any sequence of characters (including empty)
/// - `?` matches exactly one character
///
/// Every other character is literal, so there is no malformed pattern.
/// Matching is linear backtracking over the last `*` only; no regex engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    chars: Vec<char>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            chars: pattern.chars().collect(),
        }
    }

    /// True when `entry` uses wildcard syntax and should be matched as a glob.
    pub fn is_glob(entry: &str) -> bool {
        entry.contains('*') || entry.contains('?')
    }

    pub fn matches(&self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        self.matches_chars(&chars)
    }

    /// Match against text already split into chars.
    #[inline]
    pub fn matches_chars(&self, text: &[char]) -> bool {
        glob_match(&self.chars, text)
    }
}

fn glob_match(p: &[char], t: &[char]) -> bool {

    let mut pi = 0; // pattern index
    let mut ti = 0; // text index
    let mut star: Option<(usize, usize)> = None; // (pattern after *, text at *)

    while ti < t.len() || pi < p.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    while pi < p.len() && p[pi] == '*' {
                        pi += 1;
                    }
                    if pi == p.len() {
                        return true;
                    }
                    star = Some((pi, ti));
                    continue;
                }
                '?' if ti < t.len() => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                c if ti < t.len() && c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }

        // Mismatch: let the last * swallow one more character
        match star {
            Some((star_pi, star_ti)) if star_ti < t.len() => {
                pi = star_pi;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            _ => return false,
        }
    }

    true
}
