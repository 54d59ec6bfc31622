use std::cmp::Ordering;

// Version comparison as app stores expect it: digit runs compare numerically,
// everything else compares as plain characters, and a version that runs out
// first is the smaller one. Notably "1.0" < "1.0.0" and "1.2" < "1.10".
pub fn compare_versions(version1: &str, version2: &str) -> Ordering {
    let chars1: Vec<char> = version1.chars().collect();
    let chars2: Vec<char> = version2.chars().collect();
    let len1 = chars1.len();
    let len2 = chars2.len();
    let mut pos1 = 0;
    let mut pos2 = 0;

    loop {
        if pos1 == len1 && pos2 == len2 {
            return Ordering::Equal;
        } else if pos1 >= len1 {
            return Ordering::Less;
        } else if pos2 >= len2 {
            return Ordering::Greater;
        }

        let ch1 = chars1[pos1];
        let ch2 = chars2[pos2];
        pos1 += 1;
        pos2 += 1;

        if !ch1.is_ascii_digit() || !ch2.is_ascii_digit() {
            match ch1.cmp(&ch2) {
                Ordering::Equal => {}
                other => return other,
            }
        } else {
            let mut run1 = String::from(ch1);
            let mut run2 = String::from(ch2);
            while pos1 < len1 && chars1[pos1].is_ascii_digit() {
                run1.push(chars1[pos1]);
                pos1 += 1;
            }
            while pos2 < len2 && chars2[pos2].is_ascii_digit() {
                run2.push(chars2[pos2]);
                pos2 += 1;
            }

            match compare_digit_runs(&run1, &run2) {
                Ordering::Equal => {}
                other => return other,
            }
        }
    }
}

// Compares without parsing, so arbitrarily long digit runs cannot overflow.
fn compare_digit_runs(run1: &str, run2: &str) -> Ordering {
    let trimmed1 = run1.trim_start_matches('0');
    let trimmed2 = run2.trim_start_matches('0');
    match trimmed1.len().cmp(&trimmed2.len()) {
        Ordering::Equal => trimmed1.cmp(trimmed2),
        other => other,
    }
}

// RFC 1035/1123 name check for reverse-DNS application ids. If
// minimal_part_count is non-zero the name must also have at least that many
// dot-separated parts ("tld.company.app" has 3).
pub fn validate_dns_name(name: &str, minimal_part_count: usize) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < minimal_part_count {
        return false;
    }

    for part in parts {
        let len = part.len();
        if len < 1 || len > 63 {
            return false;
        }
        for (pos, ch) in part.char_indices() {
            let is_first = pos == 0;
            let is_last = pos == len - 1;
            let is_dash = ch == '-';
            let is_digit = ch.is_ascii_digit();
            let is_lower = ch.is_ascii_lowercase();

            if (is_first || is_last || !is_dash) && !is_digit && !is_lower {
                return false;
            }
        }
    }

    true
}
