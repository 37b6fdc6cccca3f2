//! The closed set of collection operations a handle can expose.

use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::error::Error;

/// A collection operation that can be enabled on a [`crate::CollectionHandle`].
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy)]
pub enum Operation {
    CountDocuments,
    EstimatedDocumentCount,
    Find,
    FindOne,
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    BulkWrite,
    Aggregate,
    Distinct,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
}

impl Operation {
    /// Every operation the crate knows how to delegate.
    pub const ALL: [Operation; 17] = [
        Operation::CountDocuments,
        Operation::EstimatedDocumentCount,
        Operation::Find,
        Operation::FindOne,
        Operation::InsertOne,
        Operation::InsertMany,
        Operation::UpdateOne,
        Operation::UpdateMany,
        Operation::ReplaceOne,
        Operation::DeleteOne,
        Operation::DeleteMany,
        Operation::BulkWrite,
        Operation::Aggregate,
        Operation::Distinct,
        Operation::FindOneAndUpdate,
        Operation::FindOneAndReplace,
        Operation::FindOneAndDelete,
    ];

    /// Operations enabled on every client.
    pub const DEFAULTS: [Operation; 12] = [
        Operation::CountDocuments,
        Operation::Find,
        Operation::FindOne,
        Operation::InsertOne,
        Operation::InsertMany,
        Operation::UpdateOne,
        Operation::UpdateMany,
        Operation::DeleteOne,
        Operation::DeleteMany,
        Operation::BulkWrite,
        Operation::Aggregate,
        Operation::Distinct,
    ];

    /// Returns the driver's camelCase name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CountDocuments => "countDocuments",
            Self::EstimatedDocumentCount => "estimatedDocumentCount",
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::InsertOne => "insertOne",
            Self::InsertMany => "insertMany",
            Self::UpdateOne => "updateOne",
            Self::UpdateMany => "updateMany",
            Self::ReplaceOne => "replaceOne",
            Self::DeleteOne => "deleteOne",
            Self::DeleteMany => "deleteMany",
            Self::BulkWrite => "bulkWrite",
            Self::Aggregate => "aggregate",
            Self::Distinct => "distinct",
            Self::FindOneAndUpdate => "findOneAndUpdate",
            Self::FindOneAndReplace => "findOneAndReplace",
            Self::FindOneAndDelete => "findOneAndDelete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Accepts the camelCase driver name or its snake_case spelling.
impl FromStr for Operation {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized: String = name.chars().filter(|c| *c != '_').collect();
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }
}

/// The set of operations enabled for a client.
///
/// Built once from the defaults plus any configured extensions and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    operations: BTreeSet<Operation>,
}

impl AllowList {
    /// Unions the default operations with the named extensions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOperation`] for the first name that does not
    /// match an [`Operation`].
    pub fn with_extensions<I, S>(names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut operations: BTreeSet<Operation> = Operation::DEFAULTS.into_iter().collect();
        for name in names {
            operations.insert(name.as_ref().parse()?);
        }
        Ok(Self { operations })
    }

    pub fn contains(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        self.operations.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            operations: Operation::DEFAULTS.into_iter().collect(),
        }
    }
}
