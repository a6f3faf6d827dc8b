use crate::image::ContentDigest;
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a stack of layers
///
/// The bottom layer's chain id is its diff id. Each layer above it hashes
/// the parent's chain id, a space, and its own diff id. Images that share
/// a prefix of layers share those chain ids.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(ContentDigest);

impl ChainId {
    /// The chain id for `diff_id` applied on top of `parent`
    ///
    /// ```
    /// # use rootless_pull::{cache::ChainId, image::ContentDigest};
    /// let diff = ContentDigest::from_content(b"layer");
    /// let base = ChainId::next(None, &diff);
    /// assert_eq!(base.digest(), &diff);
    /// assert_ne!(ChainId::next(Some(&base), &diff), base);
    /// ```
    pub fn next(parent: Option<&ChainId>, diff_id: &ContentDigest) -> Self {
        match parent {
            None => ChainId(diff_id.clone()),
            Some(parent) => ChainId(ContentDigest::from_hasher(
                Sha256::new()
                    .chain_update(parent.as_str())
                    .chain_update(" ")
                    .chain_update(diff_id.as_str()),
            )),
        }
    }

    /// Chain ids for every prefix of a list of diff ids, bottom first
    pub fn for_diff_ids<'a, I>(diff_ids: I) -> Vec<ChainId>
    where
        I: IntoIterator<Item = &'a ContentDigest>,
    {
        let mut result: Vec<ChainId> = vec![];
        for diff_id in diff_ids {
            let next = ChainId::next(result.last(), diff_id);
            result.push(next);
        }
        result
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_ids_follow_the_layer_stack() {
        let diffs: Vec<ContentDigest> = ["a", "b", "c"]
            .iter()
            .map(|s| ContentDigest::from_content(s.as_bytes()))
            .collect();
        let chain = ChainId::for_diff_ids(&diffs);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].digest(), &diffs[0]);
        let expected = ContentDigest::from_content(
            format!("{} {}", chain[0].as_str(), diffs[1].as_str()).as_bytes(),
        );
        assert_eq!(chain[1].digest(), &expected);
        assert_eq!(chain[2], ChainId::next(Some(&chain[1]), &diffs[2]));
        // Same diffs in another order make a different chain
        let reversed: Vec<ContentDigest> = diffs.iter().rev().cloned().collect();
        assert_ne!(ChainId::for_diff_ids(&reversed)[2], chain[2]);
    }

    #[test]
    fn chain_ids_serialize_as_strings() {
        let id = ChainId::next(None, &ContentDigest::from_content(b"x"));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<ChainId>(&json).unwrap(), id);
    }
}
