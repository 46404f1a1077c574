use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::extract::FieldValue;

/// Computes the identity key of a record from its identity fields
///
/// The key is a SHA-256 over `name\0value\0` pairs in declaration order, so
/// identical field content always produces the same key regardless of where
/// or when it was extracted. When `site` is given (site-scoped identity) the
/// host is folded in first.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use dredge::dedup::compute_identity_key;
/// use dredge::FieldValue;
///
/// let mut fields = BTreeMap::new();
/// fields.insert("title".to_string(), FieldValue::Text("Widget".into()));
///
/// let a = compute_identity_key(&["title".to_string()], &fields, None);
/// let b = compute_identity_key(&["title".to_string()], &fields, None);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn compute_identity_key(
    identity_fields: &[String],
    fields: &BTreeMap<String, FieldValue>,
    site: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();

    if let Some(site) = site {
        hasher.update(b"@site\0");
        hasher.update(site.as_bytes());
        hasher.update(b"\0");
    }

    digest_fields(&mut hasher, identity_fields, fields);
    hex::encode(hasher.finalize())
}

/// Computes the fingerprint of a record's tracked fields
///
/// Two records with the same content hash count as unchanged.
pub fn compute_content_hash(
    tracked_fields: &[String],
    fields: &BTreeMap<String, FieldValue>,
) -> String {
    let mut hasher = Sha256::new();
    digest_fields(&mut hasher, tracked_fields, fields);
    hex::encode(hasher.finalize())
}

fn digest_fields(hasher: &mut Sha256, names: &[String], fields: &BTreeMap<String, FieldValue>) {
    for name in names {
        let value = fields
            .get(name)
            .map_or_else(|| FieldValue::Missing.canonical(), FieldValue::canonical);
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identity_ignores_non_identity_fields() {
        let a = fields(&[
            ("title", FieldValue::Text("Widget".into())),
            ("price", FieldValue::Number(1.0)),
        ]);
        let b = fields(&[
            ("title", FieldValue::Text("Widget".into())),
            ("price", FieldValue::Number(2.0)),
        ]);

        let ids = names(&["title"]);
        assert_eq!(
            compute_identity_key(&ids, &a, None),
            compute_identity_key(&ids, &b, None)
        );
    }

    #[test]
    fn test_identity_differs_on_content() {
        let a = fields(&[("title", FieldValue::Text("Widget".into()))]);
        let b = fields(&[("title", FieldValue::Text("Gadget".into()))]);

        let ids = names(&["title"]);
        assert_ne!(
            compute_identity_key(&ids, &a, None),
            compute_identity_key(&ids, &b, None)
        );
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let a = fields(&[
            ("a", FieldValue::Text("xy".into())),
            ("b", FieldValue::Text("z".into())),
        ]);
        let b = fields(&[
            ("a", FieldValue::Text("x".into())),
            ("b", FieldValue::Text("yz".into())),
        ]);

        let ids = names(&["a", "b"]);
        assert_ne!(
            compute_identity_key(&ids, &a, None),
            compute_identity_key(&ids, &b, None)
        );
    }

    #[test]
    fn test_site_scope_folds_in_host() {
        let f = fields(&[("title", FieldValue::Text("Widget".into()))]);
        let ids = names(&["title"]);

        let content = compute_identity_key(&ids, &f, None);
        let site_a = compute_identity_key(&ids, &f, Some("a.test"));
        let site_b = compute_identity_key(&ids, &f, Some("b.test"));

        assert_ne!(content, site_a);
        assert_ne!(site_a, site_b);
    }

    #[test]
    fn test_content_hash_tracks_only_tracked_fields() {
        let a = fields(&[
            ("price", FieldValue::Number(1.0)),
            ("scraped_note", FieldValue::Text("x".into())),
        ]);
        let b = fields(&[
            ("price", FieldValue::Number(1.0)),
            ("scraped_note", FieldValue::Text("y".into())),
        ]);

        let tracked = names(&["price"]);
        assert_eq!(
            compute_content_hash(&tracked, &a),
            compute_content_hash(&tracked, &b)
        );
    }
}
