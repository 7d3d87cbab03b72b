pub mod collection;
pub mod flow;
pub mod intercept;
pub mod intruder;
pub mod rule;
pub mod scan;
pub mod sitemap;
pub mod spider;

pub use collection::{Collection, CollectionId};
pub use flow::{Body, Direction, Flow, FlowId, HeaderList, Scheme, WebSocketFrame, WebSocketOpcode};
pub use intercept::{InterceptDecision, InterceptPhase, InterceptSnapshot, ModifiedBody};
pub use intruder::{AttackConfig, AttackId, AttackStatus, AttackStrategy, AttackTemplate, IntruderAttack, IntruderResult, Position};
pub use rule::{ActionType, ApplyTo, MatchType, Phase, Rule, RuleId};
pub use scan::{CheckCategory, Confidence, IssueId, IssueStatus, ScanIssue, Severity};
pub use sitemap::{HostSiteMap, SiteMapNode};
pub use spider::{SessionId, SessionStatus, SpiderLimits, SpiderPoliteness, SpiderScope, SpiderSession, SpiderUrl, UrlStatus};
