use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static CLEAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+$").unwrap());
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Hex digits of the digest appended to ids that had to be rewritten.
const DIGEST_LEN: usize = 16;

/// Prefix of every image tag and container name created by the pipeline.
pub const NAME_PREFIX: &str = "autograder";

/// Transform a random string into a valid docker name component.
///
/// Ids are case-insensitive. A lowercased id made only of ascii letters and
/// digits is used as is. Anything else becomes its alphanumeric runs joined by
/// `-`, followed by `-` and a digest of the lowercased id. Distinct ids thus
/// never share a component, and rewritten ids never look like clean ones.
pub fn transform_string_as_docker_tag(s: &str) -> Cow<str> {
    let lower = if s.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(s.to_ascii_lowercase())
    } else {
        Cow::Borrowed(s)
    };
    if CLEAN.is_match(&lower) {
        return lower;
    }

    let digest = format!("{:x}", Sha256::digest(lower.as_bytes()));
    let digest = &digest[..DIGEST_LEN];
    let stem = SEPARATORS.replace_all(&lower, "-");
    let stem = stem.trim_matches('-');
    if stem.is_empty() {
        Cow::Owned(digest.to_owned())
    } else {
        Cow::Owned(format!("{}-{}", stem, digest))
    }
}

/// The image tag an assignment's sandbox is built and cached under.
pub fn image_tag(course_id: &str, assignment_id: &str) -> String {
    format!(
        "{}.{}.{}",
        NAME_PREFIX,
        transform_string_as_docker_tag(course_id),
        transform_string_as_docker_tag(assignment_id)
    )
}

/// A container name that is unique per run, so that no two grading tasks can
/// ever address the same container.
pub fn unique_container_name(image_tag: &str) -> String {
    format!("{}-{:016x}", image_tag.replace('.', "-"), rand::random::<u64>())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A repository name docker accepts as a single path component.
    static DOCKER_COMPONENT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").unwrap());

    #[test]
    fn test_docker_tag_transform() {
        assert_eq!(transform_string_as_docker_tag("course101"), "course101");
        assert_eq!(transform_string_as_docker_tag("A1"), "a1");

        let dashed = transform_string_as_docker_tag("CSE-140");
        assert!(dashed.starts_with("cse-140-"), "{}", dashed);
        assert_eq!(dashed.len(), "cse-140-".len() + DIGEST_LEN);
        assert_eq!(dashed, transform_string_as_docker_tag("cse-140"));

        let spaced = transform_string_as_docker_tag("hw 1/a");
        assert!(spaced.starts_with("hw-1-a-"), "{}", spaced);

        let symbols = transform_string_as_docker_tag("//");
        assert_eq!(symbols.len(), DIGEST_LEN);
    }

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("course101", "A1"), "autograder.course101.a1");
        assert_eq!(image_tag("Course101", "a1"), image_tag("course101", "A1"));
    }

    #[test]
    fn test_image_tags_are_distinct() {
        let pairs = [
            ("a.b", "c"),
            ("a", "b.c"),
            ("hw 1/a", "x"),
            ("hw_1_a", "x"),
            ("hw-1-a", "x"),
            ("hw__1__a", "x"),
            ("hw1a", "x"),
            ("-", "x"),
            ("_", "x"),
            (".", "x"),
        ];
        let tags: Vec<_> = pairs.iter().map(|(c, a)| image_tag(c, a)).collect();
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_image_tags_are_valid_docker_names() {
        for (course, assignment) in [
            ("course101", "hw0"),
            ("CSE-140", "Lab 3"),
            ("-lead", "trail-"),
            ("..", "__"),
            ("ünïcode", "作业"),
        ] {
            let tag = image_tag(course, assignment);
            assert!(DOCKER_COMPONENT.is_match(&tag), "{}", tag);
        }
    }

    #[test]
    fn test_container_names_differ() {
        let tag = image_tag("course101", "hw0");
        let a = unique_container_name(&tag);
        let b = unique_container_name(&tag);
        assert!(a.starts_with("autograder-course101-hw0-"));
        assert_ne!(a, b);
    }
}
