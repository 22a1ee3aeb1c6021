//! Path helpers shared by the tiers and the union view.

/// Normalize to `/`-rooted form with no empty segments: `a//b/` -> `/a/b`.
pub fn norm_path(p: &str) -> String {
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return "/".into();
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Split a normalized path into (parent dir, file name).
pub fn split_dir_file(path: &str) -> (String, String) {
    let n = path.rfind('/').unwrap_or(0);
    if n == 0 {
        ("/".into(), path[1..].into())
    } else {
        (path[..n].into(), path[n + 1..].into())
    }
}

/// Parent of a normalized path; `/` is its own parent.
pub fn parent_of(path: &str) -> String {
    split_dir_file(path).0
}

/// Join a normalized directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
