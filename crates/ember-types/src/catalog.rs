//! Effect declarations and their operations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Type, TypeVarId};

/// Index of an operation in an [`EffectCatalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u32);

/// Resumption discipline of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeKind {
    /// Multi-shot: the clause receives a continuation it may call any number of times.
    Resume,
    /// Single-shot: the clause must call its continuation exactly once.
    Tail,
}

impl ResumeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeKind::Resume => "resume",
            ResumeKind::Tail => "tail",
        }
    }

    /// Encoding stored in runtime handler frames.
    pub fn tag(self) -> i64 {
        match self {
            ResumeKind::Resume => 0,
            ResumeKind::Tail => 1,
        }
    }
}

/// A declared effect operation. Immutable once declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectOperation {
    pub id: OperationId,
    pub effect: String,
    pub name: String,
    /// Position of this operation inside its effect declaration.
    pub index: u32,
    pub type_params: Vec<TypeVarId>,
    pub params: Vec<Type>,
    /// `None` means the operation never returns to the performer.
    pub ret: Option<Type>,
    pub resumable: ResumeKind,
}

impl EffectOperation {
    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }

    /// Type observed at the perform site. A `resume` operation without a
    /// return type never comes back; a `tail` one resumes with `()`.
    pub fn result_type(&self) -> Type {
        match (&self.ret, self.resumable) {
            (Some(ret), _) => ret.clone(),
            (None, ResumeKind::Tail) => Type::Unit,
            (None, ResumeKind::Resume) => Type::Never,
        }
    }

    pub fn never_resumes(&self) -> bool {
        self.ret.is_none() && self.resumable == ResumeKind::Resume
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.effect, self.name)
    }
}

impl fmt::Display for EffectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}(", self.resumable.as_str(), self.effect, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")")?;
        if let Some(ret) = &self.ret {
            write!(f, " -> {ret}")?;
        }
        Ok(())
    }
}

/// Operation description used when declaring an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    #[serde(default)]
    pub type_params: Vec<TypeVarId>,
    #[serde(default)]
    pub params: Vec<Type>,
    #[serde(default)]
    pub ret: Option<Type>,
    pub resumable: ResumeKind,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>, resumable: ResumeKind) -> Self {
        Self {
            name: name.into(),
            type_params: Vec::new(),
            params: Vec::new(),
            ret: None,
            resumable,
        }
    }

    pub fn params(mut self, params: Vec<Type>) -> Self {
        self.params = params;
        self
    }

    pub fn returns(mut self, ret: Type) -> Self {
        self.ret = Some(ret);
        self
    }

    pub fn generic(mut self, type_params: Vec<TypeVarId>) -> Self {
        self.type_params = type_params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectDecl {
    pub name: String,
    pub operations: Vec<OperationId>,
    /// Stable runtime identity. Lowering hashes the name when absent.
    pub effect_id: Option<u32>,
}

/// All effects visible to a module, with overload lookup by operation name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CatalogRepr", into = "CatalogRepr")]
pub struct EffectCatalog {
    effects: Vec<EffectDecl>,
    operations: Vec<EffectOperation>,
    by_name: BTreeMap<String, Vec<OperationId>>,
}

#[derive(Serialize, Deserialize)]
struct CatalogRepr {
    effects: Vec<EffectDecl>,
    operations: Vec<EffectOperation>,
}

impl From<CatalogRepr> for EffectCatalog {
    fn from(repr: CatalogRepr) -> Self {
        let mut by_name: BTreeMap<String, Vec<OperationId>> = BTreeMap::new();
        for op in &repr.operations {
            by_name.entry(op.name.clone()).or_default().push(op.id);
        }
        Self {
            effects: repr.effects,
            operations: repr.operations,
            by_name,
        }
    }
}

impl From<EffectCatalog> for CatalogRepr {
    fn from(catalog: EffectCatalog) -> Self {
        Self {
            effects: catalog.effects,
            operations: catalog.operations,
        }
    }
}

impl EffectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an effect and its operations, returning the operation ids in
    /// declaration order.
    pub fn declare_effect(
        &mut self,
        name: impl Into<String>,
        effect_id: Option<u32>,
        operations: Vec<OperationSpec>,
    ) -> Vec<OperationId> {
        let name = name.into();
        let mut ids = Vec::with_capacity(operations.len());
        for (index, spec) in operations.into_iter().enumerate() {
            let id = OperationId(self.operations.len() as u32);
            self.by_name.entry(spec.name.clone()).or_default().push(id);
            self.operations.push(EffectOperation {
                id,
                effect: name.clone(),
                name: spec.name,
                index: index as u32,
                type_params: spec.type_params,
                params: spec.params,
                ret: spec.ret,
                resumable: spec.resumable,
            });
            ids.push(id);
        }
        self.effects.push(EffectDecl {
            name,
            operations: ids.clone(),
            effect_id,
        });
        ids
    }

    pub fn operation(&self, id: OperationId) -> Option<&EffectOperation> {
        self.operations.get(id.0 as usize)
    }

    /// Every operation sharing `name`, across all effects.
    pub fn overloads(&self, name: &str) -> Vec<&EffectOperation> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.operation(*id))
            .collect()
    }

    /// Operations named `name`, optionally restricted to one effect.
    pub fn lookup(&self, name: &str, effect: Option<&str>) -> Vec<&EffectOperation> {
        self.overloads(name)
            .into_iter()
            .filter(|op| effect.is_none_or(|e| op.effect == e))
            .collect()
    }

    pub fn effect(&self, name: &str) -> Option<&EffectDecl> {
        self.effects.iter().find(|decl| decl.name == name)
    }

    pub fn effects(&self) -> &[EffectDecl] {
        &self.effects
    }

    pub fn operations(&self) -> &[EffectOperation] {
        &self.operations
    }
}
