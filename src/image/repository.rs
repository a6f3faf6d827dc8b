use crate::errors::ImageError;
use regex::Regex;

/// Name of a Docker-style image repository
///
/// Path-like groupings of lowercase alphanumeric segments separated by
/// slashes. Inside a segment, single periods, single or double underscores,
/// and runs of dashes may separate alphanumeric groups.
#[derive(Clone)]
pub struct Repository {
    serialized: String,
}

serialized_identity!(Repository);

/// Iterator over the slash-separated components of a [Repository]
pub struct RepositoryIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> Iterator for RepositoryIter<'a> {
    type Item = &'a str;
    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        match remaining.split_once('/') {
            Some((first, rest)) => {
                self.remaining = Some(rest);
                Some(first)
            }
            None => {
                self.remaining = None;
                Some(remaining)
            }
        }
    }
}

impl Repository {
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a [prim@str] as a [Repository]
    ///
    /// ```
    /// # use rootless_pull::image::Repository;
    /// let repo = Repository::parse("some/path").unwrap();
    /// let parts: Vec<&str> = repo.iter().collect();
    /// assert_eq!(parts, vec!["some", "path"])
    /// ```
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(&format!("^{}$", Repository::regex_str())).unwrap();
        }
        if RE.is_match(s) {
            Ok(Repository {
                serialized: s.to_owned(),
            })
        } else {
            Err(ImageError::InvalidReferenceFormat(s.to_owned()))
        }
    }

    pub fn iter(&self) -> RepositoryIter<'_> {
        RepositoryIter {
            remaining: Some(&self.serialized),
        }
    }

    /// Does this path have only one component?
    pub fn is_single_component(&self) -> bool {
        !self.serialized.contains('/')
    }

    /// Join two repository paths with a slash
    pub fn join(&self, other: &Self) -> Self {
        Repository {
            serialized: format!("{}/{}", self.serialized, other.serialized),
        }
    }

    pub(crate) fn regex_str() -> &'static str {
        concat!(
            "(?P<repo>",
            /*  */ "[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*", // first component
            /*  */ "(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*", // more components
            ")"
        )
    }
}
