use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Extract → transform → load, driven by [`crate::core::returns::ReturnEngine`].
#[async_trait]
pub trait Pipeline: Send + Sync {
    type Item: Send + 'static;
    type Output: Send + 'static;

    async fn extract(&self) -> Result<Vec<Self::Item>>;
    async fn transform(&self, data: Vec<Self::Item>) -> Result<Self::Output>;
    /// Returns where the output ended up.
    async fn load(&self, result: Self::Output) -> Result<String>;
}
