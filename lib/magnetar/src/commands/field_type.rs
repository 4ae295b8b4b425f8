/// Field type bytes of the key-value message dialect.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldType {
    Namespace = 0,
    Table = 1,
    Key = 2,
    RecordVersion = 3,
    DigestRipe = 4,
    MrtId = 5,
    /// Deadline payload is little-endian, unlike every other field.
    MrtDeadline = 6,
    QueryId = 7,
    SocketTimeout = 9,
    RecordsPerSecond = 10,
    PidArray = 11,
    DigestArray = 12,
    MaxRecords = 13,
    BvalArray = 15,
    IndexRange = 22,
    UdfPackageName = 30,
    UdfFunction = 31,
    UdfArgList = 32,
    UdfOp = 33,
    BatchIndex = 41,
    FilterExp = 43,
}
