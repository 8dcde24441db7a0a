//! Constant-expression evaluation with the full C precedence ladder.
//!
//! Expressions appear in array dimensions, enumerator initializers,
//! bit-field widths and attribute arguments. Values are folded eagerly into
//! [`Val`]s; an unresolvable operand turns the whole expression into
//! `Val::Error`, which the consuming production reports.

use super::lexer::Tok;
use super::Parser;
use crate::error::Result;
use crate::marshal;
use crate::types::{CTypeKind, TypeRef};
use crate::val::{CmpOp, IntOp, MathOp, Val};

/// `(type)expr` conversion on a folded constant.
fn cast_val(val: Val, ty: &TypeRef) -> Val {
    let kind = match ty.kind_id() {
        CTypeKind::Enum => marshal::int_kind_as_ctype(ty.enum_kind().unwrap()),
        k => k,
    };
    match kind {
        CTypeKind::Float => match val.as_f64() {
            Some(d) => Val::F32(d),
            None => Val::Error,
        },
        CTypeKind::Double => match val.as_f64() {
            Some(d) => Val::F64(d),
            None => Val::Error,
        },
        CTypeKind::LongDouble => match val.as_f64() {
            Some(d) => Val::LongDouble(d),
            None => Val::Error,
        },
        CTypeKind::Uint8 | CTypeKind::Uint16 | CTypeKind::Uint32 | CTypeKind::Bool => {
            match val.as_u64() {
                Some(u) => Val::U32(u),
                None => match val.as_f64() {
                    Some(d) => Val::U32(d as u64),
                    None => Val::Error,
                },
            }
        }
        CTypeKind::Sint8 | CTypeKind::Sint16 | CTypeKind::Sint32 => match val.as_i64() {
            Some(v) => Val::I32(v),
            None => match val.as_f64() {
                Some(d) => Val::I32(d as i64),
                None => Val::Error,
            },
        },
        CTypeKind::Uint64 => match val.as_u64() {
            Some(u) => Val::U64(u),
            None => match val.as_f64() {
                Some(d) => Val::U64(d as u64),
                None => Val::Error,
            },
        },
        CTypeKind::Sint64 => match val.as_i64() {
            Some(v) => Val::I64(v),
            None => match val.as_f64() {
                Some(d) => Val::I64(d as i64),
                None => Val::Error,
            },
        },
        CTypeKind::Char => match val.as_i64() {
            Some(v) => Val::Char(v as i8),
            None => match val.as_f64() {
                Some(d) => Val::Char(d as i64 as i8),
                None => Val::Error,
            },
        },
        _ => Val::Error,
    }
}

impl Parser<'_> {
    pub(crate) fn parse_constant_expression(&mut self) -> Result<Val> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<Val> {
        let cond = self.parse_logical_or()?;
        if self.eat(&Tok::Question)? {
            let then_val = self.parse_constant_expression()?;
            self.expect(Tok::Colon, "':'")?;
            let else_val = self.parse_conditional()?;
            Ok(cond.conditional(then_val, else_val))
        } else {
            Ok(cond)
        }
    }

    fn parse_logical_or(&mut self) -> Result<Val> {
        let mut v = self.parse_logical_and()?;
        while self.eat(&Tok::OrOr)? {
            let rhs = self.parse_logical_and()?;
            v = v.bool_or(rhs);
        }
        Ok(v)
    }

    fn parse_logical_and(&mut self) -> Result<Val> {
        let mut v = self.parse_inclusive_or()?;
        while self.eat(&Tok::AndAnd)? {
            let rhs = self.parse_inclusive_or()?;
            v = v.bool_and(rhs);
        }
        Ok(v)
    }

    fn parse_inclusive_or(&mut self) -> Result<Val> {
        let mut v = self.parse_exclusive_or()?;
        while self.eat(&Tok::Pipe)? {
            let rhs = self.parse_exclusive_or()?;
            v = v.int_math(rhs, IntOp::Or);
        }
        Ok(v)
    }

    fn parse_exclusive_or(&mut self) -> Result<Val> {
        let mut v = self.parse_and()?;
        while self.eat(&Tok::Caret)? {
            let rhs = self.parse_and()?;
            v = v.int_math(rhs, IntOp::Xor);
        }
        Ok(v)
    }

    fn parse_and(&mut self) -> Result<Val> {
        let mut v = self.parse_equality()?;
        while self.eat(&Tok::Amp)? {
            let rhs = self.parse_equality()?;
            v = v.int_math(rhs, IntOp::And);
        }
        Ok(v)
    }

    fn parse_equality(&mut self) -> Result<Val> {
        let mut v = self.parse_relational()?;
        loop {
            if self.eat(&Tok::EqEq)? {
                let rhs = self.parse_relational()?;
                v = v.cmp_op(rhs, CmpOp::Eq);
            } else if self.eat(&Tok::Ne)? {
                let rhs = self.parse_relational()?;
                v = v.cmp_op(rhs, CmpOp::Ne);
            } else {
                return Ok(v);
            }
        }
    }

    fn parse_relational(&mut self) -> Result<Val> {
        let mut v = self.parse_shift()?;
        loop {
            let op = match self.tok {
                Tok::Lt => CmpOp::Lt,
                Tok::Gt => CmpOp::Gt,
                Tok::Le => CmpOp::Le,
                Tok::Ge => CmpOp::Ge,
                _ => return Ok(v),
            };
            self.advance()?;
            let rhs = self.parse_shift()?;
            v = v.cmp_op(rhs, op);
        }
    }

    fn parse_shift(&mut self) -> Result<Val> {
        let mut v = self.parse_additive()?;
        loop {
            let op = match self.tok {
                Tok::Shl => IntOp::Shl,
                Tok::Shr => IntOp::Shr,
                _ => return Ok(v),
            };
            self.advance()?;
            let rhs = self.parse_additive()?;
            v = v.int_math(rhs, op);
        }
    }

    fn parse_additive(&mut self) -> Result<Val> {
        let mut v = self.parse_multiplicative()?;
        loop {
            let op = match self.tok {
                Tok::Plus => MathOp::Add,
                Tok::Minus => MathOp::Sub,
                _ => return Ok(v),
            };
            self.advance()?;
            let rhs = self.parse_multiplicative()?;
            v = v.math(rhs, op);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Val> {
        let mut v = self.parse_cast_expr()?;
        loop {
            match self.tok {
                Tok::Star => {
                    self.advance()?;
                    let rhs = self.parse_cast_expr()?;
                    v = v.math(rhs, MathOp::Mul);
                }
                Tok::Slash => {
                    self.advance()?;
                    let rhs = self.parse_cast_expr()?;
                    v = v.math(rhs, MathOp::Div);
                }
                Tok::Percent => {
                    self.advance()?;
                    let rhs = self.parse_cast_expr()?;
                    v = v.int_math(rhs, IntOp::Mod);
                }
                _ => return Ok(v),
            }
        }
    }

    fn parse_cast_expr(&mut self) -> Result<Val> {
        if self.tok == Tok::LParen && self.peek_is_type_start()? {
            self.advance()?;
            let mut dcl = self.parse_type_name()?;
            self.expect(Tok::RParen, "')'")?;
            self.finalize(&mut dcl)?;
            let v = self.parse_cast_expr()?;
            return Ok(cast_val(v, &dcl.ty.unwrap()));
        }
        self.parse_unary()
    }

    fn parse_unary(&mut self) -> Result<Val> {
        match self.tok.clone() {
            Tok::Plus => {
                self.advance()?;
                Ok(self.parse_cast_expr()?.plus())
            }
            Tok::Minus => {
                self.advance()?;
                Ok(self.parse_cast_expr()?.neg())
            }
            Tok::Tilde => {
                self.advance()?;
                Ok(self.parse_cast_expr()?.bw_not())
            }
            Tok::Bang => {
                self.advance()?;
                Ok(self.parse_cast_expr()?.bool_not())
            }
            Tok::Ident(n) if n.as_str() == "sizeof" => self.parse_sizeof(false),
            Tok::Ident(n)
                if matches!(n.as_str(), "_Alignof" | "__alignof" | "__alignof__") =>
            {
                self.parse_sizeof(true)
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_sizeof(&mut self, alignment: bool) -> Result<Val> {
        self.advance()?;
        if self.tok == Tok::LParen && self.peek_is_type_start()? {
            self.advance()?;
            let mut dcl = self.parse_type_name()?;
            self.expect(Tok::RParen, "')'")?;
            self.finalize(&mut dcl)?;
            let ty = dcl.ty.unwrap();
            if alignment {
                Ok(Val::U32(ty.align() as u64))
            } else {
                let size = ty.size();
                Ok(if size > u32::MAX as usize {
                    Val::U64(size as u64)
                } else {
                    Val::U32(size as u64)
                })
            }
        } else {
            let v = self.parse_unary()?;
            Ok(if alignment {
                v.alignof_val()
            } else {
                v.sizeof_val()
            })
        }
    }

    fn parse_primary(&mut self) -> Result<Val> {
        match self.tok.clone() {
            Tok::Number { base, text } => {
                self.advance()?;
                Ok(Val::number(base, &text))
            }
            Tok::Float(text) => {
                self.advance()?;
                Ok(Val::float_number(&text))
            }
            Tok::CharLit(text) => {
                self.advance()?;
                Ok(Val::character(&text))
            }
            Tok::StringLit(text) => {
                self.advance()?;
                Ok(Val::string(&text))
            }
            Tok::Ident(n) => {
                self.advance()?;
                Ok(self.resolve_const(n))
            }
            Tok::LParen => {
                self.advance()?;
                let v = self.parse_constant_expression()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(v)
            }
            _ => Err(self.err("constant expression expected")),
        }
    }
}
