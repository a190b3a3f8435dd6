//! MongoDB storage: a document collection keyed on `_id`, and a GridFS variant.
//!
//! Stored documents are `{_id, data, expires}`. `expires` is a BSON date so a
//! TTL index can drop entries natively; `data` is the serialized value.

#[cfg(feature = "mongodb")]
pub use imp::{GridFsStorage, MongoStorage, from_stored_document, open_cache, open_gridfs_cache, to_stored_document};
#[cfg(not(feature = "mongodb"))]
pub use placeholder::{GridFsStorage, MongoStorage, open_cache, open_gridfs_cache};

pub const RESPONSES_COLLECTION: &str = "responses";
pub const REDIRECTS_COLLECTION: &str = "redirects";
/// Name of the TTL index on `expires`.
pub const TTL_INDEX: &str = "ttl_idx";

#[cfg(feature = "mongodb")]
mod imp {
    use std::any::Any;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures_util::TryStreamExt;
    use futures_util::io::{AsyncReadExt, AsyncWriteExt};
    use mongodb::bson::{self, Bson, Document, doc};
    use mongodb::error::ErrorKind;
    use mongodb::gridfs::GridFsBucket;
    use mongodb::options::IndexOptions;
    use mongodb::{Client, Collection, IndexModel};

    use super::{REDIRECTS_COLLECTION, RESPONSES_COLLECTION, TTL_INDEX};
    use crate::Error;
    use crate::backends::{Storage, configured_serializer};
    use crate::cache::BaseCache;
    use crate::config::{CacheConfig, MongoConfig};
    use crate::serializers::Payload;

    /// Server codes for an index that exists with different options.
    const INDEX_CONFLICT_CODES: [i32; 2] = [85, 86];

    impl From<mongodb::error::Error> for Error {
        fn from(err: mongodb::error::Error) -> Self {
            Error::Backend(format!("mongodb: {err}"))
        }
    }

    /// Document written for one entry.
    pub fn to_stored_document(key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<Document, Error> {
        let data = match value {
            Payload::Document(value) => bson::to_bson(&value).map_err(|e| Error::Serialization(e.to_string()))?,
            Payload::Text(text) => Bson::String(text),
            Payload::Bytes(bytes) => Bson::Binary(bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes }),
            Payload::Response(_) => return Err(Error::Serialization("mongodb needs a serialized value".into())),
        };
        let expires = expires.map_or(Bson::Null, |at| Bson::DateTime(bson::DateTime::from_millis(at.timestamp_millis())));
        Ok(doc! { "_id": key, "data": data, "expires": expires })
    }

    /// Value of a stored document; `None` if it has no usable `data`.
    pub fn from_stored_document(mut document: Document) -> Option<Payload> {
        match document.remove("data")? {
            Bson::String(text) => Some(Payload::Text(text)),
            Bson::Binary(binary) => Some(Payload::Bytes(binary.bytes)),
            other => bson::from_bson::<serde_json::Value>(other).ok().map(Payload::Document),
        }
    }

    /// One collection of documents keyed on `_id`.
    #[derive(Debug, Clone)]
    pub struct MongoStorage {
        collection: Collection<Document>,
    }

    impl MongoStorage {
        pub fn new(client: &Client, db_name: &str, collection: &str) -> Self {
            Self { collection: client.database(db_name).collection(collection) }
        }

        /// Create or replace the TTL index. `ttl` is the delay after `expires`
        /// before the server removes a document; `None` drops the index.
        pub async fn set_ttl(&self, ttl: Option<Duration>, overwrite: bool) -> Result<(), Error> {
            if overwrite || ttl.is_none() {
                if let Err(e) = self.collection.drop_index(TTL_INDEX).await {
                    tracing::debug!(error = %e, "no TTL index to drop");
                }
            }
            let Some(ttl) = ttl else { return Ok(()) };
            let options = IndexOptions::builder().name(TTL_INDEX.to_string()).expire_after(ttl).build();
            let model = IndexModel::builder().keys(doc! { "expires": 1 }).options(options).build();
            match self.collection.create_index(model).await {
                Ok(_) => Ok(()),
                Err(e) if is_index_conflict(&e) => {
                    tracing::warn!(error = %e, "TTL index exists with different options; pass overwrite to replace it");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    fn is_index_conflict(err: &mongodb::error::Error) -> bool {
        matches!(err.kind.as_ref(), ErrorKind::Command(cmd) if INDEX_CONFLICT_CODES.contains(&cmd.code))
    }

    fn id_of(document: &Document) -> Option<String> {
        document.get_str("_id").ok().map(str::to_string)
    }

    #[async_trait]
    impl Storage for MongoStorage {
        fn backend(&self) -> &'static str {
            "mongodb"
        }

        async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
            let found = self.collection.find_one(doc! { "_id": key }).await?;
            Ok(found.and_then(from_stored_document))
        }

        async fn set(&self, key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<(), Error> {
            let document = to_stored_document(key, value, expires)?;
            self.collection.replace_one(doc! { "_id": key }, document).upsert(true).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            let result = self.collection.delete_one(doc! { "_id": key }).await?;
            if result.deleted_count == 0 { Err(Error::KeyNotFound(key.to_string())) } else { Ok(()) }
        }

        async fn contains(&self, key: &str) -> Result<bool, Error> {
            Ok(self.collection.count_documents(doc! { "_id": key }).limit(1).await? > 0)
        }

        async fn keys(&self) -> Result<Vec<String>, Error> {
            let mut cursor = self.collection.find(doc! {}).projection(doc! { "_id": 1 }).await?;
            let mut keys = Vec::new();
            while let Some(document) = cursor.try_next().await? {
                keys.extend(id_of(&document));
            }
            Ok(keys)
        }

        async fn len(&self) -> Result<usize, Error> {
            let count = self.collection.estimated_document_count().await?;
            Ok(usize::try_from(count).unwrap_or(usize::MAX))
        }

        async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
            if keys.is_empty() {
                return Ok(0);
            }
            let result = self.collection.delete_many(doc! { "_id": { "$in": keys.to_vec() } }).await?;
            Ok(usize::try_from(result.deleted_count).unwrap_or(usize::MAX))
        }

        async fn clear(&self) -> Result<(), Error> {
            self.collection.delete_many(doc! {}).await?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Responses as GridFS files named by key, for values over the 16 MiB document limit.
    #[derive(Debug, Clone)]
    pub struct GridFsStorage {
        bucket: GridFsBucket,
    }

    impl GridFsStorage {
        pub fn new(client: &Client, db_name: &str) -> Self {
            Self { bucket: client.database(db_name).gridfs_bucket(None) }
        }

        async fn file_ids(&self, key: &str) -> Result<Vec<Bson>, Error> {
            let mut cursor = self.bucket.find(doc! { "filename": key }).await?;
            let mut ids = Vec::new();
            while let Some(file) = cursor.try_next().await? {
                ids.push(file.id);
            }
            Ok(ids)
        }
    }

    #[async_trait]
    impl Storage for GridFsStorage {
        fn backend(&self) -> &'static str {
            "gridfs"
        }

        async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
            if self.file_ids(key).await?.is_empty() {
                return Ok(None);
            }
            let mut stream = self.bucket.open_download_stream_by_name(key).await?;
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).await?;
            Ok(Some(Payload::Bytes(bytes)))
        }

        /// Replaces any earlier file with the same name.
        async fn set(&self, key: &str, value: Payload, _expires: Option<DateTime<Utc>>) -> Result<(), Error> {
            let bytes = value.into_bytes()?;
            for id in self.file_ids(key).await? {
                self.bucket.delete(id).await?;
            }
            let mut upload = self.bucket.open_upload_stream(key).await?;
            upload.write_all(&bytes).await?;
            upload.close().await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            let ids = self.file_ids(key).await?;
            if ids.is_empty() {
                return Err(Error::KeyNotFound(key.to_string()));
            }
            for id in ids {
                self.bucket.delete(id).await?;
            }
            Ok(())
        }

        async fn keys(&self) -> Result<Vec<String>, Error> {
            let mut cursor = self.bucket.find(doc! {}).await?;
            let mut keys = Vec::new();
            while let Some(file) = cursor.try_next().await? {
                keys.extend(file.filename);
            }
            keys.dedup();
            Ok(keys)
        }

        async fn clear(&self) -> Result<(), Error> {
            self.bucket.drop().await?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    async fn connect(config: &MongoConfig) -> Result<Client, Error> {
        Ok(Client::with_uri_str(&config.url).await?)
    }

    /// A MongoDB cache; `cache_name` is the database name.
    pub async fn open_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
        let client = connect(&config.mongodb).await?;
        let responses = MongoStorage::new(&client, cache_name, RESPONSES_COLLECTION);
        if config.mongodb.ttl {
            responses.set_ttl(Some(Duration::from_secs(config.mongodb.ttl_offset)), false).await?;
        }
        let redirects = MongoStorage::new(&client, cache_name, REDIRECTS_COLLECTION);
        let serializer = configured_serializer(config, "document")?;
        tracing::debug!(db = cache_name, "opened mongodb cache");
        BaseCache::new(cache_name, Arc::new(responses), Arc::new(redirects), serializer, config)
    }

    /// A GridFS cache; redirects stay in a plain collection.
    pub async fn open_gridfs_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
        let client = connect(&config.mongodb).await?;
        let responses = GridFsStorage::new(&client, cache_name);
        let redirects = MongoStorage::new(&client, cache_name, REDIRECTS_COLLECTION);
        let serializer = configured_serializer(config, "json")?;
        tracing::debug!(db = cache_name, "opened gridfs cache");
        BaseCache::new(cache_name, Arc::new(responses), Arc::new(redirects), serializer, config)
    }
}

#[cfg(not(feature = "mongodb"))]
mod placeholder {
    use crate::Error;
    use crate::cache::BaseCache;
    use crate::config::CacheConfig;

    fn missing(backend: &'static str) -> Error {
        Error::MissingDependency { backend, feature: "mongodb" }
    }

    /// Stand-in for a build without the `mongodb` feature.
    #[derive(Debug)]
    pub struct MongoStorage;

    impl MongoStorage {
        pub fn connect() -> Result<Self, Error> {
            Err(missing("mongodb"))
        }
    }

    #[derive(Debug)]
    pub struct GridFsStorage;

    impl GridFsStorage {
        pub fn connect() -> Result<Self, Error> {
            Err(missing("gridfs"))
        }
    }

    pub async fn open_cache(_cache_name: &str, _config: &CacheConfig) -> Result<BaseCache, Error> {
        Err(missing("mongodb"))
    }

    pub async fn open_gridfs_cache(_cache_name: &str, _config: &CacheConfig) -> Result<BaseCache, Error> {
        Err(missing("gridfs"))
    }
}

#[cfg(all(test, feature = "mongodb"))]
mod tests {
    use super::*;
    use crate::serializers::Payload;
    use chrono::Utc;

    #[test]
    fn test_document_round_trip() {
        let value = serde_json::json!({"status_code": 200, "url": "https://example.com"});
        let stored = to_stored_document("k", Payload::Document(value.clone()), Some(Utc::now())).unwrap();
        assert_eq!(stored.get_str("_id").unwrap(), "k");
        assert!(stored.get_datetime("expires").is_ok());

        match from_stored_document(stored) {
            Some(Payload::Document(back)) => assert_eq!(back, value),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_redirect_target_is_text() {
        let stored = to_stored_document("alias", Payload::Text("target".into()), None).unwrap();
        assert!(matches!(from_stored_document(stored), Some(Payload::Text(t)) if t == "target"));
    }
}

#[cfg(all(test, not(feature = "mongodb")))]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::CacheConfig;

    #[tokio::test]
    async fn test_placeholder_reports_missing_feature() {
        let err = open_gridfs_cache("db", &CacheConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::MissingDependency { backend: "gridfs", feature: "mongodb" }));
    }
}
