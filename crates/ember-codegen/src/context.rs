//! Module-wide lowering state: the MIR module under construction, layout
//! caches, effect ids, and call resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ember_diag::{Category, Diagnostic};
use ember_hir::{Callee, ExprId, FunctionRef, HirExpr, HirExprKind, HirModule, SymbolId};
use ember_mir::{LayoutId, MirField, MirFunction, MirModule, MirType, SiteOracle};
use ember_types::{EffectOperation, OperationId, ResumeKind, Substitution, Type};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::abi::Abi;
use crate::{BackendConfig, CodegenError, FunctionPassStats};

/// MIR representation of a semantic type.
pub fn mir_type(ty: &Type) -> MirType {
    match ty {
        Type::Int => MirType::I64,
        Type::Float => MirType::F64,
        Type::Bool | Type::Unit => MirType::I32,
        Type::String | Type::Named { .. } | Type::Tuple(_) | Type::Function(_) => MirType::Ref,
        Type::Var(_) | Type::Never => MirType::Any,
    }
}

/// Name of one instantiation of a function: `id` or `id<Int>`.
pub fn mangle(name: &str, args: &[Type]) -> String {
    if args.is_empty() {
        return name.to_string();
    }
    let args = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{name}<{args}>")
}

/// Runtime identity of a handler expression.
pub fn label_hash(label: &str) -> i64 {
    xxh3_64(label.as_bytes()) as i64
}

/// Lowering target of a direct call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallTarget {
    pub name: String,
    pub effectful: bool,
    pub params: Vec<MirType>,
    pub ret: MirType,
}

/// Per-instantiation scope shared by a function and everything nested in it.
pub(crate) struct Scope {
    /// Mangled name of the enclosing module function.
    pub instance: String,
    pub subst: Substitution,
}

impl Scope {
    pub fn apply(&self, ty: &Type) -> Type {
        self.subst.apply(ty)
    }

    pub fn mir(&self, ty: &Type) -> MirType {
        mir_type(&self.subst.apply(ty))
    }
}

/// Which expressions of an effect-ABI body can return a suspended outcome.
pub(crate) struct SiteRules<'a> {
    pub hir: &'a HirModule,
    pub tail_continuations: &'a BTreeSet<SymbolId>,
    pub effect_abi: bool,
}

impl SiteRules<'_> {
    fn callee_effectful(&self, name: &str) -> bool {
        self.hir
            .function(name)
            .is_some_and(|f| !f.effects.is_pure())
    }
}

impl SiteOracle for SiteRules<'_> {
    fn is_site(&self, expr: &HirExpr) -> bool {
        if !self.effect_abi {
            return false;
        }
        match &expr.kind {
            HirExprKind::Perform { .. } => true,
            HirExprKind::Call {
                callee: Callee::Function(fref),
                ..
            } => self.callee_effectful(&fref.name),
            HirExprKind::Call {
                callee: Callee::Expr(callee),
                ..
            } => match &callee.kind {
                HirExprKind::Var(k) if self.hir.symbols.is_continuation(*k) => {
                    !self.tail_continuations.contains(k)
                }
                _ => callee
                    .ty
                    .as_function()
                    .is_some_and(|ft| !ft.effects.is_pure()),
            },
            HirExprKind::MethodCall { method, .. } => self.callee_effectful(&method.name),
            HirExprKind::Handle(handle) => handle.meta.as_ref().is_some_and(|m| !m.row.is_pure()),
            _ => false,
        }
    }
}

pub(crate) struct CodegenContext<'h> {
    pub hir: &'h HirModule,
    pub config: &'h BackendConfig,
    pub module: MirModule,
    pub abi: Abi,
    /// Continuation symbols of clauses for tail operations.
    pub tail_continuations: BTreeSet<SymbolId>,
    env_layouts: HashMap<(ExprId, String), LayoutId>,
    bundle_layouts: HashMap<(OperationId, Vec<MirType>), LayoutId>,
    tuple_layouts: HashMap<Vec<MirType>, LayoutId>,
    effect_ids: BTreeMap<String, u32>,
    diagnostics: Vec<Diagnostic>,
    stats: BTreeMap<String, FunctionPassStats>,
}

impl<'h> CodegenContext<'h> {
    pub fn new(hir: &'h HirModule, config: &'h BackendConfig) -> Self {
        let mut module = MirModule::new();
        let abi = Abi::install(&mut module);
        abi.emit_runtime(&mut module);
        Self {
            hir,
            config,
            module,
            abi,
            tail_continuations: tail_continuations(hir),
            env_layouts: HashMap::new(),
            bundle_layouts: HashMap::new(),
            tuple_layouts: HashMap::new(),
            effect_ids: BTreeMap::new(),
            diagnostics: Vec::new(),
            stats: BTreeMap::new(),
        }
    }

    pub fn push_function(&mut self, function: MirFunction) {
        debug!(
            function = %function.name,
            kind = ?function.kind,
            blocks = function.blocks.len(),
            "emitted function"
        );
        self.module.functions.push(function);
    }

    pub fn stats_mut(&mut self, function: &str) -> &mut FunctionPassStats {
        self.stats
            .entry(function.to_string())
            .or_insert_with(|| FunctionPassStats {
                function: function.to_string(),
                ..FunctionPassStats::default()
            })
    }

    /// Runtime id of `effect`: the declared one, or a hash of its name with a
    /// one-time warning.
    pub fn effect_id(&mut self, effect: &str) -> u32 {
        if let Some(id) = self.effect_ids.get(effect) {
            return *id;
        }
        let id = match self.hir.catalog.effect(effect).and_then(|decl| decl.effect_id) {
            Some(id) => id,
            None => {
                let id = xxh3_64(effect.as_bytes()) as u32;
                warn!(effect, id, "effect has no declared id");
                self.diagnostics.push(
                    Diagnostic::warning(
                        Category::MissingEffectId,
                        format!("effect `{effect}` has no declared id; using {id:#010x}"),
                    )
                    .with_help("declare an explicit effect id to keep it stable across builds"),
                );
                id
            }
        };
        self.effect_ids.insert(effect.to_string(), id);
        id
    }

    pub fn env_layout(
        &mut self,
        expr: ExprId,
        instance: &str,
        name: String,
        fields: Vec<MirField>,
    ) -> LayoutId {
        let key = (expr, instance.to_string());
        if let Some(id) = self.env_layouts.get(&key) {
            return *id;
        }
        let id = self.module.add_layout(name, fields);
        self.env_layouts.insert(key, id);
        id
    }

    /// Argument bundle for `op`. Parameters mentioning the operation's type
    /// variables travel boxed, so every instantiation shares one layout.
    pub fn bundle_layout(&mut self, op: &EffectOperation) -> (LayoutId, Vec<MirType>) {
        let types: Vec<MirType> = op
            .params
            .iter()
            .map(|ty| if ty.has_type_vars() { MirType::Any } else { mir_type(ty) })
            .collect();
        let key = (op.id, types.clone());
        if let Some(id) = self.bundle_layouts.get(&key) {
            return (*id, types);
        }
        let fields = types
            .iter()
            .enumerate()
            .map(|(i, ty)| MirField::new(format!("a{i}"), *ty))
            .collect();
        let signature = types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let id = self
            .module
            .add_layout(format!("{}$args({signature})", op.qualified_name()), fields);
        self.bundle_layouts.insert(key, id);
        (id, types)
    }

    pub fn tuple_layout(&mut self, types: &[MirType]) -> LayoutId {
        if let Some(id) = self.tuple_layouts.get(types) {
            return *id;
        }
        let fields = types
            .iter()
            .enumerate()
            .map(|(i, ty)| MirField::new(format!("_{i}"), *ty))
            .collect();
        let name = format!(
            "tuple({})",
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        let id = self.module.add_layout(name, fields);
        self.tuple_layouts.insert(types.to_vec(), id);
        id
    }

    /// Resolve a direct call to the instantiation it targets.
    pub fn resolve_call(
        &self,
        fref: &FunctionRef,
        scope: &Scope,
    ) -> Result<CallTarget, CodegenError> {
        let callee = self
            .hir
            .function(&fref.name)
            .ok_or_else(|| CodegenError::UnknownFunction {
                function: fref.name.clone(),
            })?;
        let effectful = !callee.effects.is_pure();
        if !callee.is_generic() {
            return Ok(CallTarget {
                name: callee.name.clone(),
                effectful,
                params: callee.params.iter().map(|p| mir_type(&p.ty)).collect(),
                ret: mir_type(&callee.ret),
            });
        }

        let actual = Type::Function(match scope.apply(&Type::Function(fref.ty.clone())) {
            Type::Function(ft) => ft,
            _ => fref.ty.clone(),
        });
        let declared = Type::Function(callee.function_type());
        let matching = callee.instantiations.iter().find(|args| {
            let subst = Substitution::from_pairs(&callee.type_params, args);
            subst.apply(&declared) == actual
        });
        let args = match (matching, callee.instantiations.as_slice()) {
            (Some(args), _) => args,
            (None, [only]) => only,
            _ => {
                return Err(CodegenError::MissingInstantiation {
                    function: callee.name.clone(),
                    ty: actual.to_string(),
                });
            }
        };
        let subst = Substitution::from_pairs(&callee.type_params, args);
        Ok(CallTarget {
            name: mangle(&callee.name, args),
            effectful,
            params: callee
                .params
                .iter()
                .map(|p| mir_type(&subst.apply(&p.ty)))
                .collect(),
            ret: mir_type(&subst.apply(&callee.ret)),
        })
    }

    pub fn finish(self) -> (MirModule, Vec<Diagnostic>, BTreeMap<String, FunctionPassStats>) {
        (self.module, self.diagnostics, self.stats)
    }
}

fn tail_continuations(hir: &HirModule) -> BTreeSet<SymbolId> {
    let mut out = BTreeSet::new();
    for function in &hir.functions {
        function.body.walk(&mut |expr| {
            if let HirExprKind::Handle(handle) = &expr.kind {
                for clause in &handle.clauses {
                    let tail = clause
                        .operation
                        .resolved
                        .and_then(|id| hir.catalog.operation(id))
                        .is_some_and(|op| op.resumable == ResumeKind::Tail);
                    if tail && let Some(k) = clause.continuation {
                        out.insert(k);
                    }
                }
            }
        });
    }
    out
}
