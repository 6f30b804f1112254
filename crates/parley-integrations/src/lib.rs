pub mod mercadopago;
pub mod rest;

use std::sync::Arc;

use futures::future::BoxFuture;

use parley_core::config::AppConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::traits::{ApiClient, PaymentProvider};
use parley_core::types::{PaymentLink, PaymentRequest};

pub use mercadopago::MercadoPagoClient;
pub use rest::RestClient;

/// Build the REST client over every `[integrations.*]` entry.
pub fn create_api_client(config: &AppConfig) -> Arc<dyn ApiClient> {
    Arc::new(RestClient::new(config.integrations.clone()))
}

/// Build the payment provider, or one that fails every request when no
/// provider is configured.
pub fn create_payment_provider(config: &AppConfig) -> Arc<dyn PaymentProvider> {
    match &config.payments.mercadopago {
        Some(mp) => Arc::new(MercadoPagoClient::new(mp.clone())),
        None => Arc::new(Unconfigured),
    }
}

/// Payment provider used when none is configured. PaymentLink nodes record
/// the failure and the turn continues.
pub struct Unconfigured;

impl PaymentProvider for Unconfigured {
    fn create_link(&self, _request: PaymentRequest) -> BoxFuture<'_, Result<PaymentLink>> {
        Box::pin(async {
            Err(ParleyError::collaborator(
                "payments",
                "no payment provider configured",
            ))
        })
    }
}
