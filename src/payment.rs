//! The payment-provider seam. The engine only depends on the correlation
//! contract: hand the provider an amount, an owner identity and a
//! server-issued token, get a checkout link back; the provider later reports
//! the outcome through the `payment_callbacks` entry point with that token.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount_cents: i64,
    pub owner: String,
    pub correlation_token: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone)]
pub struct Checkout {
    pub link: String,
}

#[derive(Debug)]
pub struct GatewayError(pub String);

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for GatewayError {}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(&self, request: &CheckoutRequest) -> Result<Checkout, GatewayError>;
}

/// Gateway for hosted checkout pages: builds the link that sends the client
/// to the provider with the correlation token and redirect target attached.
/// Verification never flows through this type — it arrives via the
/// `payment_callbacks` entry point.
pub struct RedirectGateway {
    checkout_url: String,
}

impl RedirectGateway {
    pub fn new(checkout_url: String) -> Self {
        Self { checkout_url }
    }
}

#[async_trait]
impl PaymentGateway for RedirectGateway {
    async fn initiate(&self, request: &CheckoutRequest) -> Result<Checkout, GatewayError> {
        if request.amount_cents <= 0 {
            return Err(GatewayError("amount must be positive".into()));
        }
        // The provider-facing payload, in the shape hosted checkout expects.
        let payload = serde_json::json!({
            "amount": format!("{}.{:02}", request.amount_cents / 100, request.amount_cents % 100),
            "currency": "USD",
            "customer": { "email": request.owner },
            "tx_ref": request.correlation_token,
            "redirect_url": request.redirect_url,
        });
        tracing::debug!(payload = %payload, "initiating checkout");

        // Tokens are ULIDs and amounts are numeric, so the query string needs
        // no escaping.
        let link = format!(
            "{}?tx_ref={}&amount_cents={}",
            self.checkout_url, request.correlation_token, request.amount_cents
        );
        Ok(Checkout { link })
    }
}
