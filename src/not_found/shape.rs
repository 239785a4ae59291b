use url::Url;

use crate::utils::hash_one;

const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

/// Normalized URL "shape": authority, directory path with numeric segments
/// generalized, and the filename reduced to its extension.
///
/// `http://h/item/12/view.php?id=3` and `http://h/item/7/edit.php` share
/// `http://h:80/item/{n}/{file}.php`.
pub fn url_shape(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let port = url.port_or_known_default()?;
    let mut out = format!("{}://{}:{}", url.scheme(), host, port);

    let path = url.path();
    let (dir, file) = match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    };
    let segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    let last = segments.len().saturating_sub(1);
    for (i, seg) in segments.iter().enumerate() {
        out.push('/');
        if seg.chars().all(|c| c.is_ascii_digit()) {
            out.push_str("{n}");
        } else if file.is_empty() && i == last {
            out.push_str("{dir}");
        } else {
            out.push_str(seg);
        }
    }
    out.push('/');

    if !file.is_empty() {
        match file.rsplit_once('.') {
            Some(("", ext)) => {
                out.push_str("{hidden}.");
                out.push_str(&ext.to_ascii_lowercase());
            }
            Some((_, ext)) => {
                out.push_str("{file}.");
                out.push_str(&ext.to_ascii_lowercase());
            }
            None => out.push_str("{file}"),
        }
    }
    Some(out)
}

/// Small deterministic generator so probe names are reproducible per URL.
struct SplitMix(u64);

impl SplitMix {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn rand_alnum(rng: &mut SplitMix, len: usize) -> String {
    (0..len)
        .map(|_| ALNUM[rng.below(ALNUM.len())] as char)
        .collect()
}

fn should_flip(index: usize, seed: u64) -> bool {
    let mut rng = SplitMix(index as u64 ^ seed.rotate_left(17));
    rng.next() % 5 < 3
}

fn with_extension(name: String, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{name}.{ext}"),
        None => name,
    }
}

fn flip_pairs(name: &str, seed: u64) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len());
    for (i, pair) in chars.chunks(2).enumerate() {
        match pair {
            [x, y] if should_flip(i, seed)
                && ((x.is_ascii_digit() && y.is_ascii_digit())
                    || (x.is_ascii_alphabetic() && y.is_ascii_alphabetic())) =>
            {
                out.push(*y);
                out.push(*x);
            }
            _ => out.extend(pair.iter()),
        }
    }
    out
}

fn rotate3(name: &str, seed: u64) -> String {
    let mut chars: Vec<char> = name.chars().collect();
    for i in 0..chars.len() {
        if !should_flip(i, seed) {
            continue;
        }
        let c = chars[i];
        let rotated = if let Some(pos) = LETTERS.iter().position(|&l| l as char == c) {
            LETTERS[(pos + 3) % LETTERS.len()] as char
        } else if let Some(pos) = DIGITS.iter().position(|&d| d as char == c) {
            DIGITS[(pos + 3) % DIGITS.len()] as char
        } else {
            c
        };
        chars[i] = rotated;
        if rotated != c {
            break;
        }
    }
    chars.into_iter().collect()
}

fn shuffle(name: &str, rng: &mut SplitMix) -> String {
    let mut chars: Vec<char> = name.chars().collect();
    for i in (1..chars.len()).rev() {
        let j = rng.below(i + 1);
        chars.swap(i, j);
    }
    chars.into_iter().collect()
}

/// Mutates a filename into one that almost certainly does not exist while
/// keeping its length, character classes and extension.
pub fn mutate_filename(filename: &str, seed: u64) -> String {
    let mut rng = SplitMix(hash_one(filename, seed));
    if filename.is_empty() {
        return rand_alnum(&mut rng, 5);
    }
    let (name, ext) = match filename.rsplit_once('.') {
        Some((name, ext)) => (name, Some(ext)),
        None => (filename, None),
    };
    if name.is_empty() {
        return with_extension(rand_alnum(&mut rng, 5), ext);
    }
    if name.chars().count() <= 2 {
        return with_extension(format!("{}{}", rand_alnum(&mut rng, 4), name), ext);
    }

    let flipped = with_extension(flip_pairs(name, seed), ext);
    if flipped != filename {
        return flipped;
    }
    let rotated = with_extension(rotate3(name, seed), ext);
    if rotated != filename {
        return rotated;
    }
    let shuffled = with_extension(shuffle(name, &mut rng), ext);
    if shuffled != filename {
        return shuffled;
    }
    with_extension(format!("{}{}", rand_alnum(&mut rng, 4), name), ext)
}

/// A URL of the same shape as `url` that should not exist on the target.
pub fn probe_url(url: &Url, seed: u64) -> Option<Url> {
    let path = url.path();
    let filename = path.rsplit('/').next().unwrap_or_default();
    let mut probe = url.clone();
    probe.set_query(None);
    probe.set_fragment(None);

    if path == "/" || !filename.is_empty() {
        let mutated = mutate_filename(filename, seed);
        let dir = &path[..path.len() - filename.len()];
        probe.set_path(&format!("{dir}{mutated}"));
        return Some(probe);
    }

    let mut rng = SplitMix(hash_one(url.as_str(), seed));
    let relative = format!("../{}/", rand_alnum(&mut rng, 8));
    probe.join(&relative).ok()
}

/// Removes the URL's own path pieces from a body so pages that echo the
/// requested path compare equal.
pub fn clean_body(body: &str, url: &Url) -> String {
    let mut out = body.replace(url.as_str(), "");
    let path = url.path();
    if path.len() > 1 {
        out = out.replace(path, "");
    }
    for seg in path.split('/').filter(|s| s.len() >= 3) {
        out = out.replace(seg, "");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn shapes_generalize_numbers_and_filenames() {
        let a = url_shape(&u("http://h/item/12/view.php?id=3")).unwrap();
        let b = url_shape(&u("http://H/item/7/edit.PHP")).unwrap();
        assert_eq!(a, "http://h:80/item/{n}/{file}.php");
        assert_eq!(a, b);
        assert_ne!(a, url_shape(&u("http://h/item/7/edit.asp")).unwrap());
    }

    #[test]
    fn directory_shapes_generalize_last_segment() {
        let a = url_shape(&u("https://h/a/b/")).unwrap();
        assert_eq!(a, "https://h:443/a/{dir}/");
        assert_eq!(a, url_shape(&u("https://h/a/zzz/")).unwrap());
        assert_eq!(url_shape(&u("https://h/")).unwrap(), "https://h:443/");
    }

    #[test]
    fn hidden_files_keep_extension() {
        assert_eq!(
            url_shape(&u("http://h/.env")).unwrap(),
            "http://h:80/{hidden}.env"
        );
        let m = mutate_filename(".env", 1);
        assert!(m.ends_with(".env"));
        assert_eq!(m.len(), 9);
    }

    #[test]
    fn mutation_changes_name_and_keeps_extension() {
        for name in ["index.php", "ab.html", "a-b-c", "aaaa.jsp", "login", "12345"] {
            let m = mutate_filename(name, 3);
            assert_ne!(m, name, "mutation of {name}");
            if let Some((_, ext)) = name.rsplit_once('.') {
                assert!(m.ends_with(&format!(".{ext}")), "{m} keeps .{ext}");
            }
        }
    }

    #[test]
    fn probe_keeps_shape_for_files_and_directories() {
        let file = u("http://h/app/12/view.php?x=1");
        let probe = probe_url(&file, 0).unwrap();
        assert_ne!(probe, file);
        assert!(probe.query().is_none());
        assert_eq!(url_shape(&probe), url_shape(&file));

        let dir = u("http://h/app/admin/");
        let probe = probe_url(&dir, 0).unwrap();
        assert_ne!(probe, dir);
        assert!(probe.path().starts_with("/app/"));
        assert_eq!(url_shape(&probe), url_shape(&dir));
    }

    #[test]
    fn probe_is_deterministic_per_seed() {
        let url = u("http://h/a/report.pdf");
        assert_eq!(probe_url(&url, 1), probe_url(&url, 1));
    }

    #[test]
    fn clean_body_strips_echoed_path() {
        let url = u("http://h/app/missing.php");
        let body = "The page /app/missing.php was not found";
        assert_eq!(clean_body(body, &url), "The page  was not found");
    }
}
