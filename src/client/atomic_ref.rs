use super::{unexpected, CpClient, FencedLock};
use crate::cp::{FenceCheck, FencingToken, Operation, Reply};
use crate::error::CpError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// A value read together with the generation it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: Option<T>,
    pub generation: u64,
}

/// A named linearizable register holding a `T`, stored as JSON
pub struct AtomicReference<T> {
    client: CpClient,
    name: String,
    value: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> AtomicReference<T> {
    pub(super) fn new(client: CpClient, name: String) -> Self {
        AtomicReference {
            client,
            name,
            value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<Option<T>, CpError> {
        Ok(self.get_versioned().await?.value)
    }

    pub async fn get_versioned(&self) -> Result<Versioned<T>, CpError> {
        match self
            .client
            .read(Operation::RefGet {
                name: self.name.clone(),
            })
            .await?
        {
            Reply::Value { value, generation } => Ok(Versioned {
                value: value.map(|bytes| serde_json::from_slice(&bytes)).transpose()?,
                generation,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Unconditional overwrite, returns the new generation
    pub async fn set(&self, value: &T) -> Result<u64, CpError> {
        self.write(Some(serde_json::to_vec(value)?)).await
    }

    pub async fn clear(&self) -> Result<u64, CpError> {
        self.write(None).await
    }

    /// Writes only if the generation is still `expected_generation`
    pub async fn compare_and_set(&self, expected_generation: u64, value: &T) -> Result<bool, CpError> {
        self.swap(expected_generation, value, None).await
    }

    /// As `compare_and_set`, additionally refused with `StaleFence` unless `lock` is still held under `fence`
    pub async fn compare_and_set_fenced(
        &self,
        expected_generation: u64,
        value: &T,
        lock: &FencedLock,
        fence: FencingToken,
    ) -> Result<bool, CpError> {
        let check = FenceCheck {
            lock: lock.name().to_string(),
            token: fence,
        };
        self.swap(expected_generation, value, Some(check)).await
    }

    async fn write(&self, value: Option<Vec<u8>>) -> Result<u64, CpError> {
        match self
            .client
            .write(Operation::RefSet {
                name: self.name.clone(),
                value,
            })
            .await?
        {
            Reply::Written { generation } => Ok(generation),
            other => Err(unexpected(other)),
        }
    }

    async fn swap(&self, expected_generation: u64, value: &T, fence: Option<FenceCheck>) -> Result<bool, CpError> {
        let value = Some(serde_json::to_vec(value)?);
        match self
            .client
            .write(Operation::RefCompareAndSet {
                name: self.name.clone(),
                expected_generation,
                value,
                fence,
            })
            .await?
        {
            Reply::Swapped { swapped, .. } => Ok(swapped),
            other => Err(unexpected(other)),
        }
    }
}
