//! Helper macros for declaring entity wrappers.

/// Declare a typed node wrapping a [`Queryable`](crate::Queryable) and
/// implementing [`Node`](crate::Node), so it inherits composition, query
/// building, batching and the verbs.
///
/// # Example
///
/// ```rust
/// use sprest_client::{queryable_node, Node};
///
/// queryable_node! {
///     /// The site users collection.
///     pub struct SiteUsers;
/// }
///
/// impl SiteUsers {
///     pub fn get_by_email(&self, email: &str) -> sprest_client::Queryable {
///         self.child(&format!("getByEmail('{}')", email))
///     }
/// }
/// ```
#[macro_export]
macro_rules! queryable_node {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name($crate::Queryable);

        impl $crate::Node for $name {
            fn from_queryable(queryable: $crate::Queryable) -> Self {
                $name(queryable)
            }

            fn queryable(&self) -> &$crate::Queryable {
                &self.0
            }

            fn queryable_mut(&mut self) -> &mut $crate::Queryable {
                &mut self.0
            }

            fn into_queryable(self) -> $crate::Queryable {
                self.0
            }
        }
    };
}

/// Header list for [`Node::with_headers`](crate::Node::with_headers).
///
/// # Example
///
/// ```rust
/// use sprest_client::headers;
/// let h = headers! {
///     "Accept" => "application/json;odata=nometadata",
///     "X-ClientService-ClientTag" => "sprest",
/// };
/// assert_eq!(h.len(), 2);
/// ```
#[macro_export]
macro_rules! headers {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let headers: ::std::vec::Vec<(::std::string::String, ::std::string::String)> =
            vec![$(($name.to_string(), $value.to_string())),*];
        headers
    }};
}

#[cfg(test)]
mod tests {
    use crate::client::{Client, ClientConfig};
    use crate::queryable::Node;
    use sprest_transport::MockTransport;

    queryable_node! {
        /// Test wrapper.
        struct Folders;
    }

    #[test]
    fn test_queryable_node_macro() {
        let client = Client::with_transport(
            ClientConfig::new("https://contoso.sharepoint.com/sites/dev"),
            MockTransport::new(),
        )
        .unwrap();
        let folders: Folders = client.at("_api/web/folders").unwrap();
        let folder: Folders = folders.clone().top(2).child("getByUrl('Shared Documents')");
        assert_eq!(
            folder.to_url(),
            "https://contoso.sharepoint.com/sites/dev/_api/web/folders/getByUrl('Shared%20Documents')?$top=2"
        );
        assert_eq!(folders.into_queryable().composer().query().len(), 0);
    }

    #[test]
    fn test_headers_macro() {
        let h = headers! {
            "Accept" => "application/json",
            "Prefer" => String::from("HonorNonIndexedQueriesWarningMayFailRandomly"),
        };
        assert_eq!(h[0], ("Accept".to_string(), "application/json".to_string()));
        assert_eq!(h.len(), 2);

        let empty = headers! {};
        assert!(empty.is_empty());
    }
}
