//! Provider Payloads
//!
//! Every provider answers with one variant of `ProviderPayload`. The variant decides how
//! the raw positions become normalized `WalletItem`s; each has its own mapping function.

use crate::aggregation::types::{Account, ChainId, ItemKind, ProviderId, WalletItem, WorkKey};

use serde::{Deserialize, Serialize};

/// Input handed to a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub provider: ProviderId,
    pub account: Account,
    pub chain: ChainId,
    pub attempt: u32,
}

/// Successful adapter answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub payload: ProviderPayload,
    /// More work the provider discovered it needs (added to the running job).
    #[serde(default)]
    pub follow_ups: Vec<WorkKey>,
}

impl ProviderResponse {
    pub fn new(payload: ProviderPayload) -> Self {
        Self {
            payload,
            follow_ups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    pub balance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LendingPosition {
    pub protocol: String,
    pub asset: TokenBalance,
    pub supplied: String,
    pub borrowed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityPosition {
    pub protocol: String,
    pub pool: String,
    pub tokens: Vec<TokenBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockedPosition {
    pub protocol: String,
    pub token: TokenBalance,
    pub unlock_at: Option<u64>,
}

/// Provider-specific result body, tagged by provider family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum ProviderPayload {
    TokenBalances(Vec<TokenBalance>),
    LendingPositions(Vec<LendingPosition>),
    LiquidityPositions(Vec<LiquidityPosition>),
    LockedPositions(Vec<LockedPosition>),
}

/// Turns a provider payload into normalized wallet items.
pub trait PayloadMapper: Send + Sync {
    fn map(&self, provider: &ProviderId, payload: &ProviderPayload, chain: &ChainId)
    -> Vec<WalletItem>;
}

/// Default mapper: one mapping per payload variant, zero amounts dropped.
#[derive(Debug, Default, Clone)]
pub struct StandardMapper;

impl PayloadMapper for StandardMapper {
    fn map(
        &self,
        provider: &ProviderId,
        payload: &ProviderPayload,
        chain: &ChainId,
    ) -> Vec<WalletItem> {
        let ctx = ItemContext {
            source: format!("{}:{}", provider, chain),
            provider,
            chain,
        };

        match payload {
            ProviderPayload::TokenBalances(balances) => map_token_balances(&ctx, balances),
            ProviderPayload::LendingPositions(positions) => map_lending(&ctx, positions),
            ProviderPayload::LiquidityPositions(positions) => map_liquidity(&ctx, positions),
            ProviderPayload::LockedPositions(positions) => map_locked(&ctx, positions),
        }
    }
}

struct ItemContext<'a> {
    source: String,
    provider: &'a ProviderId,
    chain: &'a ChainId,
}

impl ItemContext<'_> {
    fn item(
        &self,
        kind: ItemKind,
        protocol: Option<&str>,
        token: &TokenBalance,
        amount: &str,
    ) -> Option<WalletItem> {
        if is_zero(amount) {
            return None;
        }

        Some(WalletItem {
            source: self.source.clone(),
            provider: self.provider.clone(),
            chain: self.chain.clone(),
            kind,
            protocol: protocol.map(str::to_string),
            symbol: token.symbol.clone(),
            address: (!token.address.is_empty()).then(|| token.address.to_lowercase()),
            amount: amount.trim().to_string(),
            decimals: token.decimals,
            unlock_at: None,
        })
    }
}

fn is_zero(amount: &str) -> bool {
    let amount = amount.trim();
    amount.is_empty() || amount.chars().all(|c| c == '0' || c == '.')
}

fn map_token_balances(ctx: &ItemContext<'_>, balances: &[TokenBalance]) -> Vec<WalletItem> {
    balances
        .iter()
        .filter_map(|token| ctx.item(ItemKind::Token, None, token, &token.balance))
        .collect()
}

fn map_lending(ctx: &ItemContext<'_>, positions: &[LendingPosition]) -> Vec<WalletItem> {
    positions
        .iter()
        .flat_map(|position| {
            let protocol = Some(position.protocol.as_str());
            [
                ctx.item(ItemKind::Supplied, protocol, &position.asset, &position.supplied),
                ctx.item(ItemKind::Borrowed, protocol, &position.asset, &position.borrowed),
            ]
        })
        .flatten()
        .collect()
}

fn map_liquidity(ctx: &ItemContext<'_>, positions: &[LiquidityPosition]) -> Vec<WalletItem> {
    positions
        .iter()
        .flat_map(|position| {
            position.tokens.iter().filter_map(move |token| {
                ctx.item(
                    ItemKind::Liquidity,
                    Some(position.protocol.as_str()),
                    token,
                    &token.balance,
                )
            })
        })
        .collect()
}

fn map_locked(ctx: &ItemContext<'_>, positions: &[LockedPosition]) -> Vec<WalletItem> {
    positions
        .iter()
        .filter_map(|position| {
            let mut item = ctx.item(
                ItemKind::Locked,
                Some(position.protocol.as_str()),
                &position.token,
                &position.token.balance,
            )?;
            item.unlock_at = position.unlock_at;
            Some(item)
        })
        .collect()
}
