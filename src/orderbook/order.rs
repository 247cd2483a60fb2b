//! Order, contract and confirmation types shared across the platform.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Order side. Short sells are tracked separately for locate/visibility but
/// count as the sell side everywhere in accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Side {
    #[default]
    Buy,
    Sell,
    Short,
}

impl Side {
    /// FIX-style wire code.
    pub fn code(&self) -> char {
        match self {
            Side::Buy => '1',
            Side::Sell => '2',
            Side::Short => '5',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            '1' => Side::Buy,
            '2' => Side::Sell,
            '5' => Side::Short,
            _ => return None,
        })
    }

    /// Case-insensitive parse of client spellings.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Some(match lower.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            "short" | "short sell" | "sell short" => Side::Short,
            _ => return None,
        })
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

/// Order type. `Otc` fills immediately off-exchange at the supplied price;
/// `Cx` routes to the internal cross engine instead of any adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrdType {
    Market,
    #[default]
    Limit,
    Stop,
    StopLimit,
    Otc,
    Cx,
}

impl OrdType {
    pub fn code(&self) -> char {
        match self {
            OrdType::Market => '1',
            OrdType::Limit => '2',
            OrdType::Stop => '3',
            OrdType::StopLimit => '4',
            OrdType::Otc => 'o',
            OrdType::Cx => 'x',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            '1' => OrdType::Market,
            '2' => OrdType::Limit,
            '3' => OrdType::Stop,
            '4' => OrdType::StopLimit,
            'o' => OrdType::Otc,
            'x' => OrdType::Cx,
            _ => return None,
        })
    }

    /// OTC and internal crosses never touch outstanding-exposure accounting.
    pub fn is_otc(&self) -> bool {
        matches!(self, OrdType::Otc | OrdType::Cx)
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Tif {
    #[default]
    Day,
    GoodTillCancel,
    AtTheOpening,
    ImmediateOrCancel,
    FillOrKill,
    GoodTillCrossing,
    GoodTillDate,
}

impl Tif {
    pub fn code(&self) -> char {
        match self {
            Tif::Day => '0',
            Tif::GoodTillCancel => '1',
            Tif::AtTheOpening => '2',
            Tif::ImmediateOrCancel => '3',
            Tif::FillOrKill => '4',
            Tif::GoodTillCrossing => '5',
            Tif::GoodTillDate => '6',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            '0' => Tif::Day,
            '1' => Tif::GoodTillCancel,
            '2' => Tif::AtTheOpening,
            '3' => Tif::ImmediateOrCancel,
            '4' => Tif::FillOrKill,
            '5' => Tif::GoodTillCrossing,
            '6' => Tif::GoodTillDate,
            _ => return None,
        })
    }
}

/// Order status, doubling as the confirmation execution type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    Unknown,
    UnconfirmedNew,
    PendingNew,
    New,
    PartiallyFilled,
    Filled,
    DoneForDay,
    Canceled,
    PendingCancel,
    Rejected,
    Suspended,
    Calculated,
    Expired,
    RiskRejected,
    UnconfirmedCancel,
    CancelRejected,
}

impl OrderStatus {
    /// Whether an order in this status still rests with a venue (or is on
    /// its way there).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::UnconfirmedNew
                | OrderStatus::PendingNew
                | OrderStatus::New
                | OrderStatus::Suspended
                | OrderStatus::PartiallyFilled
        )
    }

    /// Terminal statuses that release outstanding leaves.
    pub fn releases_leaves(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Calculated
                | OrderStatus::DoneForDay
        )
    }
}

/// Execution transaction type of a fill confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecTransType {
    #[default]
    New,
    /// A cancel-bust: backs out a previously reported execution.
    Cancel,
    Correct,
    Status,
}

/// Client-facing order intent; the base of [`Order`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contract {
    pub security_id: u32,
    pub sub_account_id: u16,
    pub qty: f64,
    pub price: f64,
    pub stop_price: f64,
    pub side: Side,
    pub ord_type: OrdType,
    pub tif: Tif,
    /// Venue override for smart-routed flow; normally empty and resolved from
    /// the sub-account's broker map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Free-form adapter attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<HashMap<String, String>>,
}

/// A live or historical order owned by the global order book.
///
/// Orders reference every related entity by id only (catalog entries, the
/// owning algo, the algo's instrument); resolution goes through the owning
/// manager, never through stored pointers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    #[serde(flatten)]
    pub contract: Contract,
    /// Process-unique, monotone order id.
    pub id: u32,
    /// 0 for a new order; the id of the order being cancelled otherwise.
    pub orig_id: u32,
    pub status: OrderStatus,
    pub avg_px: f64,
    pub cum_qty: f64,
    pub leaves_qty: f64,
    /// Submit time, µs UTC.
    pub tm: i64,
    pub user_id: u16,
    /// Assigned by dispatch from the sub-account broker map.
    pub broker_account_id: u16,
    /// Owning algo (0 = manual/frontend order).
    pub algo_id: u32,
    /// Owning algo instrument (0 = none).
    pub instrument_id: u64,
}

impl Order {
    pub fn from_contract(contract: Contract, user_id: u16) -> Self {
        Self {
            contract,
            user_id,
            ..Default::default()
        }
    }

    pub fn is_buy(&self) -> bool {
        self.contract.side.is_buy()
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn security_id(&self) -> u32 {
        self.contract.security_id
    }

    pub fn sub_account_id(&self) -> u16 {
        self.contract.sub_account_id
    }

    pub fn qty(&self) -> f64 {
        self.contract.qty
    }

    pub fn price(&self) -> f64 {
        self.contract.price
    }

    pub fn ord_type(&self) -> OrdType {
        self.contract.ord_type
    }
}

/// A confirmation applied to one order: adapter callbacks, risk rejections
/// and synthetic OTC/cross fills all funnel through this record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Confirmation {
    pub order_id: u32,
    pub exec_type: OrderStatus,
    #[serde(default)]
    pub exec_trans_type: ExecTransType,
    /// Fill quantity for (partially) filled exec types.
    #[serde(default)]
    pub last_shares: f64,
    /// Fill price for (partially) filled exec types.
    #[serde(default)]
    pub last_px: f64,
    /// Outstanding quantity released by a terminal exec type; captured by the
    /// order book while applying the confirmation.
    #[serde(default)]
    pub leaves_qty: f64,
    /// Adapter-supplied execution id, used for duplicate suppression.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exec_id: String,
    /// Venue order id (on New) or human-readable reason text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Transaction time, µs UTC.
    pub transaction_time: i64,
    /// Journal sequence number, assigned by the order book.
    #[serde(default)]
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misc: Option<HashMap<String, String>>,
}

impl Confirmation {
    /// A plain (non-fill) confirmation.
    pub fn status(order_id: u32, exec_type: OrderStatus, text: impl Into<String>, tm: i64) -> Self {
        Self {
            order_id,
            exec_type,
            text: text.into(),
            transaction_time: if tm != 0 { tm } else { crate::utils::now_micros() },
            ..Default::default()
        }
    }

    /// A fill (or cancel-bust when `trans` is [`ExecTransType::Cancel`]).
    pub fn fill(
        order_id: u32,
        last_shares: f64,
        last_px: f64,
        exec_id: impl Into<String>,
        trans: ExecTransType,
        tm: i64,
    ) -> Self {
        Self {
            order_id,
            // The book refines this to PartiallyFilled/Filled as it applies.
            exec_type: OrderStatus::Filled,
            exec_trans_type: trans,
            last_shares,
            last_px,
            exec_id: exec_id.into(),
            transaction_time: if tm != 0 { tm } else { crate::utils::now_micros() },
            ..Default::default()
        }
    }

    pub fn is_fill(&self) -> bool {
        matches!(
            self.exec_type,
            OrderStatus::PartiallyFilled | OrderStatus::Filled
        )
    }
}
