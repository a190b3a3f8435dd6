//! DynamoDB storage.
//!
//! One table per cache, partition key `key`. Responses and redirects share
//! it under the prefixes `responses:` and `redirects:`. With TTL enabled,
//! each item carries a `ttl` attribute (Unix seconds) that DynamoDB uses to
//! delete it natively.

use chrono::{DateTime, Utc};

#[cfg(feature = "dynamodb")]
pub use imp::{DynamoStorage, open_cache};
#[cfg(not(feature = "dynamodb"))]
pub use placeholder::{DynamoStorage, open_cache};

pub const KEY_ATTRIBUTE: &str = "key";
pub const VALUE_ATTRIBUTE: &str = "value";
pub const TTL_ATTRIBUTE: &str = "ttl";

/// Partition key for `key` within one of the two maps.
pub fn item_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

/// Value of the `ttl` attribute: expiration plus `ttl_offset`, in Unix seconds.
pub fn ttl_attribute(expires: Option<DateTime<Utc>>, ttl_offset: i64) -> Option<String> {
    expires.map(|at| (at.timestamp() + ttl_offset).to_string())
}

#[cfg(feature = "dynamodb")]
mod imp {
    use std::any::Any;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use aws_config::BehaviorVersion;
    use aws_sdk_dynamodb::Client;
    use aws_sdk_dynamodb::config::Region;
    use aws_sdk_dynamodb::error::DisplayErrorContext;
    use aws_sdk_dynamodb::primitives::Blob;
    use aws_sdk_dynamodb::types::{
        AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType, ReturnValue, ScalarAttributeType,
        TimeToLiveSpecification,
    };
    use chrono::{DateTime, Utc};

    use super::{KEY_ATTRIBUTE, TTL_ATTRIBUTE, VALUE_ATTRIBUTE, item_key, ttl_attribute};
    use crate::Error;
    use crate::backends::{Storage, configured_serializer};
    use crate::cache::BaseCache;
    use crate::config::{CacheConfig, DynamoConfig};
    use crate::serializers::Payload;

    fn backend_error(err: impl std::error::Error) -> Error {
        Error::Backend(format!("dynamodb: {}", DisplayErrorContext(err)))
    }

    /// One of the two maps of a cache table.
    #[derive(Debug, Clone)]
    pub struct DynamoStorage {
        client: Client,
        table: String,
        namespace: String,
        ttl: bool,
        ttl_offset: i64,
    }

    impl DynamoStorage {
        pub fn new(client: Client, table: &str, namespace: &str, config: &DynamoConfig) -> Self {
            Self {
                client,
                table: table.to_string(),
                namespace: namespace.to_string(),
                ttl: config.ttl,
                ttl_offset: config.ttl_offset,
            }
        }

        /// Create the table and enable TTL; both are no-ops if already done.
        pub async fn ensure_table(&self) -> Result<(), Error> {
            let attribute = AttributeDefinition::builder()
                .attribute_name(KEY_ATTRIBUTE)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(backend_error)?;
            let schema = KeySchemaElement::builder()
                .attribute_name(KEY_ATTRIBUTE)
                .key_type(KeyType::Hash)
                .build()
                .map_err(backend_error)?;
            let created = self
                .client
                .create_table()
                .table_name(&self.table)
                .attribute_definitions(attribute)
                .key_schema(schema)
                .billing_mode(BillingMode::PayPerRequest)
                .send()
                .await;
            match created {
                Ok(_) => tracing::info!(table = %self.table, "created dynamodb table"),
                Err(e) => tracing::debug!(table = %self.table, error = %DisplayErrorContext(&e), "table not created"),
            }

            if self.ttl {
                let spec = TimeToLiveSpecification::builder()
                    .attribute_name(TTL_ATTRIBUTE)
                    .enabled(true)
                    .build()
                    .map_err(backend_error)?;
                let updated = self
                    .client
                    .update_time_to_live()
                    .table_name(&self.table)
                    .time_to_live_specification(spec)
                    .send()
                    .await;
                if let Err(e) = updated {
                    tracing::debug!(table = %self.table, error = %DisplayErrorContext(&e), "TTL not updated");
                }
            }
            Ok(())
        }

        fn full_key(&self, key: &str) -> AttributeValue {
            AttributeValue::S(item_key(&self.namespace, key))
        }

        fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
            key.strip_prefix(&self.namespace).and_then(|rest| rest.strip_prefix(':'))
        }

        async fn scan_keys(&self) -> Result<Vec<String>, Error> {
            let mut keys = Vec::new();
            let mut start: Option<HashMap<String, AttributeValue>> = None;
            loop {
                let page = self
                    .client
                    .scan()
                    .table_name(&self.table)
                    .projection_expression("#k")
                    .filter_expression("begins_with(#k, :prefix)")
                    .expression_attribute_names("#k", KEY_ATTRIBUTE)
                    .expression_attribute_values(":prefix", AttributeValue::S(format!("{}:", self.namespace)))
                    .set_exclusive_start_key(start.take())
                    .send()
                    .await
                    .map_err(backend_error)?;
                for item in page.items() {
                    if let Some(AttributeValue::S(full)) = item.get(KEY_ATTRIBUTE) {
                        keys.extend(self.strip(full).map(str::to_string));
                    }
                }
                match page.last_evaluated_key() {
                    Some(last) if !last.is_empty() => start = Some(last.clone()),
                    _ => break,
                }
            }
            Ok(keys)
        }
    }

    #[async_trait]
    impl Storage for DynamoStorage {
        fn backend(&self) -> &'static str {
            "dynamodb"
        }

        async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
            let output = self
                .client
                .get_item()
                .table_name(&self.table)
                .key(KEY_ATTRIBUTE, self.full_key(key))
                .send()
                .await
                .map_err(backend_error)?;
            let value = output.item().and_then(|item| match item.get(VALUE_ATTRIBUTE) {
                Some(AttributeValue::B(blob)) => Some(Payload::Bytes(blob.clone().into_inner())),
                Some(AttributeValue::S(text)) => Some(Payload::Text(text.clone())),
                _ => None,
            });
            Ok(value)
        }

        async fn set(&self, key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<(), Error> {
            let mut request = self
                .client
                .put_item()
                .table_name(&self.table)
                .item(KEY_ATTRIBUTE, self.full_key(key))
                .item(VALUE_ATTRIBUTE, AttributeValue::B(Blob::new(value.into_bytes()?)));
            if let Some(ttl) = ttl_attribute(expires, self.ttl_offset).filter(|_| self.ttl) {
                request = request.item(TTL_ATTRIBUTE, AttributeValue::N(ttl));
            }
            request.send().await.map_err(backend_error)?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            let output = self
                .client
                .delete_item()
                .table_name(&self.table)
                .key(KEY_ATTRIBUTE, self.full_key(key))
                .return_values(ReturnValue::AllOld)
                .send()
                .await
                .map_err(backend_error)?;
            match output.attributes() {
                Some(old) if !old.is_empty() => Ok(()),
                _ => Err(Error::KeyNotFound(key.to_string())),
            }
        }

        async fn keys(&self) -> Result<Vec<String>, Error> {
            self.scan_keys().await
        }

        async fn clear(&self) -> Result<(), Error> {
            let keys = self.scan_keys().await?;
            self.bulk_delete(&keys).await.map(|_| ())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    async fn client(config: &DynamoConfig) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        Client::new(&loader.load().await)
    }

    /// A DynamoDB cache; `cache_name` is the table name.
    pub async fn open_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
        let client = client(&config.dynamodb).await;
        let responses = DynamoStorage::new(client.clone(), cache_name, "responses", &config.dynamodb);
        if config.dynamodb.create_table {
            responses.ensure_table().await?;
        }
        let redirects = DynamoStorage::new(client, cache_name, "redirects", &config.dynamodb);
        let serializer = configured_serializer(config, "json")?;
        BaseCache::new(cache_name, Arc::new(responses), Arc::new(redirects), serializer, config)
    }
}

#[cfg(not(feature = "dynamodb"))]
mod placeholder {
    use crate::Error;
    use crate::cache::BaseCache;
    use crate::config::CacheConfig;

    fn missing() -> Error {
        Error::MissingDependency { backend: "dynamodb", feature: "dynamodb" }
    }

    /// Stand-in for a build without the `dynamodb` feature.
    #[derive(Debug)]
    pub struct DynamoStorage;

    impl DynamoStorage {
        pub fn connect() -> Result<Self, Error> {
            Err(missing())
        }
    }

    pub async fn open_cache(_cache_name: &str, _config: &CacheConfig) -> Result<BaseCache, Error> {
        Err(missing())
    }
}
