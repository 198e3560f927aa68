use std::env;
use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::info;
use url::Url;

use crate::Error;
use crate::Result;
use crate::sinker::{BlobStore, PutOutcome};

/// [BlobStore] over any `object_store` backend (`gs://`, `s3://`, `file://`, `memory://`).
/// Puts are whole-object, atomic and create-only, so a partially written artifact is never
/// visible and an existing object is never replaced.
#[derive(Debug, Clone)]
pub(crate) struct ObjectStoreBlob {
    store: Arc<dyn ObjectStore>,
    root: ObjectPath,
    /// The local filesystem backend cannot persist object attributes.
    content_type_attribute: bool,
}

impl ObjectStoreBlob {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, root: ObjectPath, content_type_attribute: bool) -> Self {
        Self {
            store,
            root,
            content_type_attribute,
        }
    }

    /// Builds the store from the output directory URL. Cloud credentials are picked up from the
    /// environment the same way the backend builders read them.
    pub(crate) fn from_url(directory: &str) -> Result<Self> {
        let url = Url::parse(directory)
            .map_err(|e| Error::Config(format!("invalid output directory {directory:?}: {e}")))?;
        let options = env::vars().map(|(k, v)| (k.to_ascii_lowercase(), v));
        let (store, root) = object_store::parse_url_opts(&url, options)
            .map_err(|e| Error::Config(format!("unsupported output directory {directory:?}: {e}")))?;
        info!(scheme = url.scheme(), %root, "Created object store sink");
        Ok(Self::new(Arc::from(store), root, url.scheme() != "file"))
    }

    fn location(&self, relative: &str) -> ObjectPath {
        let root = self.root.as_ref();
        if root.is_empty() {
            ObjectPath::from(relative)
        } else {
            ObjectPath::from(format!("{root}/{relative}"))
        }
    }
}

impl BlobStore for ObjectStoreBlob {
    async fn put_object(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &'static str,
    ) -> Result<PutOutcome> {
        let mut attributes = Attributes::new();
        if self.content_type_attribute {
            attributes.insert(Attribute::ContentType, content_type.into());
        }
        let opts = PutOptions {
            mode: PutMode::Create,
            attributes,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&self.location(path), PutPayload::from_bytes(bytes), opts)
            .await
        {
            Ok(_) => Ok(PutOutcome::Created),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn head_object(&self, path: &str) -> Result<Option<u64>> {
        match self.store.head(&self.location(path)).await {
            Ok(meta) => Ok(Some(meta.size)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_object(&self, path: &str) -> Result<Option<Bytes>> {
        match self.store.get(&self.location(path)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let memory = Arc::new(InMemory::new());
        let blob = ObjectStoreBlob::new(Arc::clone(&memory) as _, ObjectPath::from("logs"), true);

        assert_eq!(blob.head_object("a.gz").await.unwrap(), None);
        assert_eq!(blob.get_object("a.gz").await.unwrap(), None);

        let outcome = blob
            .put_object("a.gz", Bytes::from_static(b"abc"), "application/gzip")
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Created);

        assert_eq!(blob.head_object("a.gz").await.unwrap(), Some(3));
        assert_eq!(
            blob.get_object("a.gz").await.unwrap(),
            Some(Bytes::from_static(b"abc"))
        );

        let stored = memory.get(&ObjectPath::from("logs/a.gz")).await.unwrap();
        assert_eq!(
            stored
                .attributes
                .get(&Attribute::ContentType)
                .map(|v| v.to_string()),
            Some("application/gzip".to_string())
        );
    }

    #[tokio::test]
    async fn test_existing_object_is_never_replaced() {
        let blob = ObjectStoreBlob::new(Arc::new(InMemory::new()), ObjectPath::default(), true);
        let first = blob
            .put_object("k", Bytes::from_static(b"one"), "application/json")
            .await
            .unwrap();
        let second = blob
            .put_object("k", Bytes::from_static(b"three"), "application/json")
            .await
            .unwrap();
        assert_eq!(first, PutOutcome::Created);
        assert_eq!(second, PutOutcome::AlreadyExists);
        assert_eq!(
            blob.get_object("k").await.unwrap(),
            Some(Bytes::from_static(b"one"))
        );
    }

    #[tokio::test]
    async fn test_local_filesystem_from_url() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}/", dir.path().display());
        let blob = ObjectStoreBlob::from_url(&url).unwrap();

        blob.put_object(
            "2024/03/09/w.json",
            Bytes::from_static(b"line\n"),
            "application/json",
        )
        .await
        .unwrap();
        // create-only on the local filesystem too
        let again = blob
            .put_object(
                "2024/03/09/w.json",
                Bytes::from_static(b"other\n"),
                "application/json",
            )
            .await
            .unwrap();
        assert_eq!(again, PutOutcome::AlreadyExists);

        let written = std::fs::read(dir.path().join("2024/03/09/w.json")).unwrap();
        assert_eq!(written, b"line\n");
        assert_eq!(blob.head_object("2024/03/09/w.json").await.unwrap(), Some(5));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        assert!(matches!(
            ObjectStoreBlob::from_url("not a url/"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ObjectStoreBlob::from_url("ftp://host/dir/"),
            Err(Error::Config(_))
        ));
    }
}
