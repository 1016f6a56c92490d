//! Worker-protocol opcode and status tables.

use std::fmt;

/// Worker-protocol operations, by wire opcode.
///
/// The table is closed: integers outside it are a protocol error, and
/// `from_code` returns `None` so callers carry the raw value in their
/// error rather than smuggling it through the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum WorkerOp {
    Nop = 0,
    IsValidPath = 1,
    HasSubstitutes = 3,
    QueryReferrers = 6,
    AddToStore = 7,
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    AddIndirectRoot = 12,
    SyncWithGC = 13,
    FindRoots = 14,
    SetOptions = 19,
    CollectGarbage = 20,
    QuerySubstitutablePathInfo = 21,
    QueryAllValidPaths = 23,
    QueryPathInfo = 26,
    QueryPathFromHashPart = 29,
    QuerySubstitutablePathInfos = 30,
    QueryValidPaths = 31,
    QuerySubstitutablePaths = 32,
    QueryValidDerivers = 33,
    OptimiseStore = 34,
    VerifyStore = 35,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
    RegisterDrvOutput = 42,
    QueryRealisation = 43,
    AddMultipleToStore = 44,
}

impl WorkerOp {
    /// Look up an opcode by wire value.
    pub fn from_code(code: u64) -> Option<Self> {
        use WorkerOp::*;
        Some(match code {
            0 => Nop,
            1 => IsValidPath,
            3 => HasSubstitutes,
            6 => QueryReferrers,
            7 => AddToStore,
            9 => BuildPaths,
            10 => EnsurePath,
            11 => AddTempRoot,
            12 => AddIndirectRoot,
            13 => SyncWithGC,
            14 => FindRoots,
            19 => SetOptions,
            20 => CollectGarbage,
            21 => QuerySubstitutablePathInfo,
            23 => QueryAllValidPaths,
            26 => QueryPathInfo,
            29 => QueryPathFromHashPart,
            30 => QuerySubstitutablePathInfos,
            31 => QueryValidPaths,
            32 => QuerySubstitutablePaths,
            33 => QueryValidDerivers,
            34 => OptimiseStore,
            35 => VerifyStore,
            36 => BuildDerivation,
            37 => AddSignatures,
            38 => NarFromPath,
            39 => AddToStoreNar,
            40 => QueryMissing,
            41 => QueryDerivationOutputMap,
            42 => RegisterDrvOutput,
            43 => QueryRealisation,
            44 => AddMultipleToStore,
            _ => return None,
        })
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for WorkerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Outcome codes for a build, as written in a build-result reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    /// Possibly transient.
    TransientFailure = 6,
    /// No longer used by current daemons.
    CachedFailure = 7,
    TimedOut = 8,
    MiscFailure = 9,
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
}

impl BuildStatus {
    pub fn code(self) -> u64 {
        self as u64
    }
}
